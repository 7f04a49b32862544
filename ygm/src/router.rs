//! Next-hop routing over a [`Layout`].
//!
//! `NONE` routes directly. `NR` ("node-routed") makes at most two hops: one
//! remote hop onto the destination's node followed by at most one on-node
//! hop. `NLNR` ("node-local then node-routed") makes at most three hops,
//! choosing a deterministic on-node representative to carry each remote hop
//! so that a given pair of nodes always communicates through the same core,
//! which bounds the number of distinct cross-node channels in use. The set
//! of cross-node rank pairs `NLNR` uses is a subset of those `NR` uses —
//! the termination barrier relies on this to reason about in-flight counts
//! independent of routing mode.

use std::str::FromStr;

use crate::layout::Layout;

/// Routing policy applied by the send aggregator and dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingMode {
    /// Direct delivery; `next_hop(d) == d`.
    None,
    /// Node-routed: at most one remote hop, then at most one on-node hop.
    NodeRouted,
    /// Node-local then node-routed: at most one on-node hop, then at most
    /// one remote hop, then at most one on-node hop.
    NodeLocalNodeRouted,
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "NR" => Ok(Self::NodeRouted),
            "NLNR" => Ok(Self::NodeLocalNodeRouted),
            other => Err(format!("unknown routing mode {other:?}")),
        }
    }
}

/// Computes the next hop for a final destination under a [`RoutingMode`].
#[derive(Debug, Clone)]
pub struct Router {
    layout: Layout,
    default_mode: RoutingMode,
}

impl Router {
    pub fn new(layout: Layout, default_mode: RoutingMode) -> Self {
        Self {
            layout,
            default_mode,
        }
    }

    pub fn default_mode(&self) -> RoutingMode {
        self.default_mode
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Next hop toward `dest` using this router's default routing mode.
    pub fn next_hop(&self, dest: i32) -> i32 {
        self.next_hop_with(dest, self.default_mode)
    }

    /// Next hop toward `dest` under an explicit routing mode.
    pub fn next_hop_with(&self, dest: i32, mode: RoutingMode) -> i32 {
        match mode {
            RoutingMode::None => dest,
            RoutingMode::NodeRouted => {
                if self.layout.is_local(dest) {
                    dest
                } else {
                    self.layout.strided_ranks()[self.layout.node_id_of(dest) as usize]
                }
            }
            RoutingMode::NodeLocalNodeRouted => {
                if self.layout.is_local(dest) {
                    return dest;
                }
                let dest_node = self.layout.node_id_of(dest);
                let offset = (dest_node + self.layout.node_id()).rem_euclid(self.layout.local_size());
                let local_comm_rank = self.layout.local_ranks()[offset as usize];

                if self.layout.rank() == local_comm_rank {
                    self.layout.strided_ranks()[dest_node as usize]
                } else {
                    local_comm_rank
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_at(rank: i32, mode: RoutingMode) -> Router {
        let layout = Layout::new(rank, 8, 2).unwrap();
        Router::new(layout, mode)
    }

    #[test]
    fn none_is_direct() {
        let router = router_at(0, RoutingMode::None);
        for d in 0..8 {
            assert_eq!(router.next_hop(d), d);
        }
    }

    #[test]
    fn nr_local_is_direct() {
        let router = router_at(0, RoutingMode::NodeRouted);
        assert_eq!(router.next_hop(1), 1);
    }

    #[test]
    fn nr_remote_goes_through_strided_peer() {
        let router = router_at(0, RoutingMode::NodeRouted);
        // dest 5 is node 2, local 1; strided peer at local id 0 (this rank's
        // local id) on node 2 is rank 4.
        assert_eq!(router.next_hop(5), 4);
    }

    #[test]
    fn nlnr_within_two_hops_of_nr_channel_set() {
        // For every (src, dest) pair, the remote hop NLNR takes (if any)
        // must also be a hop NR would take from some rank on the same node.
        for src in 0..8 {
            let nr = router_at(src, RoutingMode::NodeRouted);
            let nlnr = router_at(src, RoutingMode::NodeLocalNodeRouted);
            for dest in 0..8 {
                if nr.layout().is_local(dest) {
                    continue;
                }
                let nlnr_hop = nlnr.next_hop(dest);
                // either a same-node hop, or the same remote rank NR would
                // reach from this node's representative at the computed
                // channel offset.
                if nlnr.layout().is_local(nlnr_hop) {
                    continue;
                }
                assert_eq!(nlnr_hop, nr.layout().strided_ranks()[nr.layout().node_id_of(dest) as usize]);
            }
        }
    }

    #[test]
    fn routing_mode_parses_case_insensitively() {
        assert_eq!("nr".parse::<RoutingMode>().unwrap(), RoutingMode::NodeRouted);
        assert_eq!("nlnr".parse::<RoutingMode>().unwrap(), RoutingMode::NodeLocalNodeRouted);
        assert!("bogus".parse::<RoutingMode>().is_err());
    }

    /// Walks `next_hop` from whichever rank currently holds the message,
    /// rooting a fresh `Router` at each holder in turn (mirroring how a real
    /// forward re-evaluates routing from the receiving rank), until `dest`
    /// is reached or `max_hops` is exceeded.
    fn hops_to_deliver(size: i32, local_size: i32, src: i32, dest: i32, mode: RoutingMode, max_hops: u32) -> Option<u32> {
        let mut current = src;
        for hop in 0..=max_hops {
            if current == dest {
                return Some(hop);
            }
            let layout = Layout::new(current, size, local_size).expect("uniform by construction");
            let router = Router::new(layout, mode);
            current = router.next_hop(dest);
        }
        None
    }

    proptest::proptest! {
        #[test]
        fn nr_and_nlnr_always_converge_within_three_hops(
            local_size in 1i32..5,
            nodes in 1i32..6,
            src_offset in 0i32..30,
            dest_offset in 0i32..30,
        ) {
            let size = local_size * nodes;
            let src = src_offset % size;
            let dest = dest_offset % size;
            for mode in [RoutingMode::NodeRouted, RoutingMode::NodeLocalNodeRouted] {
                let hops = hops_to_deliver(size, local_size, src, dest, mode, 3);
                proptest::prop_assert!(hops.is_some(), "src={src} dest={dest} size={size} local_size={local_size} mode={mode:?} did not converge within 3 hops");
            }
        }
    }
}
