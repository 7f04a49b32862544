//! Tree all-reduce, value broadcast, and typed point-to-point helpers.
//!
//! Every collective here first drives the engine to quiescence: the tree
//! walk below uses blocking point-to-point sends on the auxiliary channel,
//! which is only safe because nothing else is left in flight by the time a
//! caller reaches this module — see `Engine::barrier`.

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{EngineError, Result},
    layout::Layout,
    substrate::{Channel, Substrate},
};

fn parent(rank: i32) -> Option<i32> {
    if rank == 0 {
        None
    } else {
        Some((rank - 1) / 2)
    }
}

fn children(rank: i32, size: i32) -> (Option<i32>, Option<i32>) {
    let left = 2 * rank + 1;
    let right = 2 * rank + 2;
    (
        (left < size).then_some(left),
        (right < size).then_some(right),
    )
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| EngineError::Invariant(format!("collective encode failed: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| EngineError::Invariant(format!("collective decode failed: {e}")))
}

/// Binary-tree reduction of `value` across every rank using `merge`,
/// followed by a broadcast of the result from rank 0. Parent is `(r-1)/2`,
/// children are `2r+1` and `2r+2`.
pub fn all_reduce<T, F>(substrate: &dyn Substrate, layout: &Layout, value: T, merge: F) -> Result<T>
where
    T: Serialize + DeserializeOwned + Clone,
    F: Fn(T, T) -> T,
{
    let rank = layout.rank();
    let size = layout.size();
    let (left, right) = children(rank, size);

    let mut acc = value;
    if let Some(child) = left {
        let bytes = substrate.recv_blocking(child, Channel::Aux)?;
        acc = merge(acc, decode(&bytes)?);
    }
    if let Some(child) = right {
        let bytes = substrate.recv_blocking(child, Channel::Aux)?;
        acc = merge(acc, decode(&bytes)?);
    }
    if let Some(p) = parent(rank) {
        substrate.send_blocking(p, Channel::Aux, &encode(&acc)?)?;
    }

    bcast(substrate, layout, if rank == 0 { Some(acc) } else { None }, 0)
}

/// Broadcasts `value` (present only at `root`) to every rank, down the same
/// binary tree `all_reduce` uses, rooted at rank 0. A non-zero `root` first
/// relays its value to rank 0 with one blocking point-to-point hop.
pub fn bcast<T>(substrate: &dyn Substrate, layout: &Layout, value: Option<T>, root: i32) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let rank = layout.rank();
    let size = layout.size();

    let root_bytes: Option<Vec<u8>> = if rank == 0 {
        if root == 0 {
            Some(encode(&value.expect("root rank must supply a value"))?)
        } else {
            Some(substrate.recv_blocking(root, Channel::Aux)?)
        }
    } else if rank == root {
        substrate.send_blocking(0, Channel::Aux, &encode(&value.expect("root rank must supply a value"))?)?;
        None
    } else {
        None
    };

    let bytes = if rank == 0 {
        root_bytes.expect("rank 0 always resolves a value in the branches above")
    } else {
        let p = parent(rank).expect("only rank 0 has no parent");
        substrate.recv_blocking(p, Channel::Aux)?
    };

    let (left, right) = children(rank, size);
    if let Some(child) = left {
        substrate.send_blocking(child, Channel::Aux, &bytes)?;
    }
    if let Some(child) = right {
        substrate.send_blocking(child, Channel::Aux, &bytes)?;
    }

    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::local::LocalSubstrate;
    use std::thread;

    #[test]
    fn tree_topology_matches_heap_indexing() {
        assert_eq!(parent(0), None);
        assert_eq!(parent(1), Some(0));
        assert_eq!(parent(4), Some(1));
        assert_eq!(children(0, 5), (Some(1), Some(2)));
        assert_eq!(children(2, 5), (None, None));
    }

    #[test]
    fn all_reduce_sum_across_four_ranks() {
        let subs = LocalSubstrate::cluster(4);
        let layouts: Vec<_> = (0..4).map(|r| Layout::new(r, 4, 4).unwrap()).collect();
        let handles: Vec<_> = subs
            .into_iter()
            .zip(layouts)
            .map(|(sub, layout)| {
                thread::spawn(move || all_reduce(&sub, &layout, layout.rank() as i64, |a, b| a + b).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 0 + 1 + 2 + 3);
        }
    }

    #[test]
    fn bcast_from_nonzero_root_reaches_every_rank() {
        let subs = LocalSubstrate::cluster(4);
        let layouts: Vec<_> = (0..4).map(|r| Layout::new(r, 4, 4).unwrap()).collect();
        let handles: Vec<_> = subs
            .into_iter()
            .zip(layouts)
            .map(|(sub, layout)| {
                let value = if layout.rank() == 3 { Some("hello".to_string()) } else { None };
                thread::spawn(move || bcast(&sub, &layout, value, 3).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), "hello");
        }
    }
}
