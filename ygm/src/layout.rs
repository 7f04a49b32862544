//! Static topology inquiry.
//!
//! The engine assumes ranks are laid out on nodes in contiguous blocks of
//! uniform size `L`: rank `r` lives on node `n(r) = r / L` at local id
//! `l(r) = r % L`. This mirrors the grouping a real deployment gets from
//! `MPI_Comm_split_type(MPI_COMM_TYPE_SHARED)`, without requiring the
//! engine to depend on shared-memory detection: `L` is supplied by
//! configuration because the substrate trait has no notion of "same node".

use crate::error::{EngineError, Result};

/// Immutable topology view built once at engine construction.
#[derive(Debug, Clone)]
pub struct Layout {
    size: i32,
    rank: i32,
    local_size: i32,
    node_size: i32,
    node_id: i32,
    local_id: i32,
    local_ranks: Vec<i32>,
    strided_ranks: Vec<i32>,
}

impl Layout {
    /// Builds a layout for a communicator of `size` ranks with uniform
    /// intra-node size `local_size`, for the calling rank `rank`.
    ///
    /// Fails if ranks cannot be distributed uniformly across nodes, i.e. if
    /// `size` is not a multiple of `local_size`.
    pub fn new(rank: i32, size: i32, local_size: i32) -> Result<Self> {
        if local_size <= 0 || size <= 0 || rank < 0 || rank >= size {
            return Err(EngineError::InvalidConfig(format!(
                "invalid layout parameters: rank={rank} size={size} local_size={local_size}"
            )));
        }
        if size % local_size != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "ranks are not uniformly distributed across nodes: size={size} is not a multiple of local_size={local_size}"
            )));
        }

        let node_size = size / local_size;
        let node_id = rank / local_size;
        let local_id = rank % local_size;

        let local_ranks = (0..local_size).map(|l| node_id * local_size + l).collect();
        let strided_ranks = (0..node_size).map(|n| n * local_size + local_id).collect();

        Ok(Self {
            size,
            rank,
            local_size,
            node_size,
            node_id,
            local_id,
            local_ranks,
            strided_ranks,
        })
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn local_size(&self) -> i32 {
        self.local_size
    }

    pub fn node_size(&self) -> i32 {
        self.node_size
    }

    pub fn node_id(&self) -> i32 {
        self.node_id
    }

    pub fn local_id(&self) -> i32 {
        self.local_id
    }

    /// Node id of an arbitrary rank.
    pub fn node_id_of(&self, rank: i32) -> i32 {
        rank / self.local_size
    }

    /// Local id of an arbitrary rank.
    pub fn local_id_of(&self, rank: i32) -> i32 {
        rank % self.local_size
    }

    /// Whether `rank` lives on this rank's node.
    pub fn is_local(&self, rank: i32) -> bool {
        self.node_id_of(rank) == self.node_id
    }

    /// The rank at node `node_id`, local id `local_id`.
    pub fn nl_to_rank(&self, node_id: i32, local_id: i32) -> i32 {
        node_id * self.local_size + local_id
    }

    /// The `local_size` ranks sharing this rank's node, in local-id order.
    pub fn local_ranks(&self) -> &[i32] {
        &self.local_ranks
    }

    /// One representative rank per node, all at this rank's local id.
    pub fn strided_ranks(&self) -> &[i32] {
        &self.strided_ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_uniform_distribution() {
        assert!(Layout::new(0, 10, 3).is_err());
    }

    #[test]
    fn computes_node_and_local_id() {
        // 8 ranks, 2 per node -> 4 nodes
        let layout = Layout::new(5, 8, 2).unwrap();
        assert_eq!(layout.node_id(), 2);
        assert_eq!(layout.local_id(), 1);
        assert_eq!(layout.node_size(), 4);
    }

    #[test]
    fn local_and_strided_ranks() {
        let layout = Layout::new(5, 8, 2).unwrap();
        assert_eq!(layout.local_ranks(), &[4, 5]);
        assert_eq!(layout.strided_ranks(), &[1, 3, 5, 7]);
    }

    #[test]
    fn is_local_matches_node_membership() {
        let layout = Layout::new(0, 8, 2).unwrap();
        assert!(layout.is_local(1));
        assert!(!layout.is_local(2));
    }
}
