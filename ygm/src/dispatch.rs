//! Frame-by-frame dispatch of a completed receive buffer.
//!
//! Walks a buffer that may hold several back-to-back frames, delivering each
//! locally or forwarding it raw toward its next hop. `final_dest ==
//! `[`BROADCAST_FINAL_DEST`]` is always treated as local delivery, never as
//! something to forward via the router — broadcast frames propagate through
//! their own relay trampoline re-issuing fresh `async` calls (see
//! `engine::bcast`), not through this generic forwarding path.

use tracing::trace;

use crate::{
    engine::Engine,
    error::Result,
    frame::{FrameCursor, BROADCAST_FINAL_DEST},
};

/// Walks every frame in `data`, delivering or forwarding each in turn.
pub fn process_buffer(engine: &Engine, source: i32, data: &[u8]) -> Result<()> {
    let mut cursor = FrameCursor::new(data);
    while !cursor.at_end() {
        process_one_frame(engine, source, &mut cursor)?;
    }
    Ok(())
}

fn process_one_frame(engine: &Engine, source: i32, cursor: &mut FrameCursor<'_>) -> Result<()> {
    let routing_enabled = engine.routing_enabled();
    let tracing_enabled = engine.tracing_enabled();

    let routing_header = cursor.read_routing_header(routing_enabled)?;
    let tracing_header = cursor.read_tracing_header(tracing_enabled)?;

    let is_local = match routing_header {
        None => true,
        Some(h) => h.final_dest == engine.rank() || h.final_dest == BROADCAST_FINAL_DEST,
    };

    if is_local {
        let tag = cursor.read_tag()?;
        trace!(source, tag, "dispatching local frame");
        engine.record_recv();
        engine.registry_dispatch(tag, cursor)?;
        Ok(())
    } else {
        let h = routing_header.expect("forward path only reached when a routing header was read");
        let payload_len = h.payload_size as usize;
        let payload = cursor.copy_payload(payload_len)?;
        let next_hop = engine.router_next_hop(h.final_dest);
        trace!(final_dest = h.final_dest, next_hop, "forwarding frame");
        engine.forward_frame(next_hop, h.final_dest, tracing_header, payload)
    }
}
