//! Compact tag ↔ trampoline registry.
//!
//! Per the no-captures closure-transport convention adopted for this
//! rewrite (see `DESIGN.md`), every remotely invocable function is a plain
//! `fn`/`Fn` over a serializable argument tuple — there is no captured
//! state to ship, so a frame never carries a captures image, only a tag and
//! the argument bytes. Tags are assigned by registration order, which must
//! be identical on every rank: this is a caller obligation (every rank must
//! run the same sequence of `register` calls at startup), not something the
//! registry can check across ranks without a barrier no caller wants to pay
//! for on every registration.

use serde::de::DeserializeOwned;

use crate::{
    engine::Engine,
    error::{EngineError, Result},
    frame::FrameCursor,
};

/// A compact, process-local identifier for a registered trampoline. Equal
/// tags on different ranks refer to the same trampoline only because
/// registration order is identical everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u16);

type TrampolineFn = Box<dyn Fn(&Engine, &mut FrameCursor<'_>) -> Result<()> + Send + Sync>;

/// Maps tags to trampolines. Built once, identically, on every rank before
/// any `async` call is issued.
#[derive(Default)]
pub struct LambdaRegistry {
    trampolines: Vec<TrampolineFn>,
}

impl LambdaRegistry {
    pub fn new() -> Self {
        Self {
            trampolines: Vec::new(),
        }
    }

    /// Registers a callable of shape `(&Engine, Args) -> anyhow::Result<()>`
    /// and returns the tag assigned to it. Must be called in the same order
    /// on every rank.
    pub fn register<Args, F>(&mut self, f: F) -> Tag
    where
        Args: DeserializeOwned + 'static,
        F: Fn(&Engine, Args) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let tag = u16::try_from(self.trampolines.len())
            .expect("fewer than 65536 distinct remotely invocable functions");
        let trampoline: TrampolineFn = Box::new(move |engine, cursor| {
            let bytes = cursor.remaining_bytes();
            let mut reader = std::io::Cursor::new(bytes);
            let args: Args = bincode::deserialize_from(&mut reader).map_err(|e| {
                EngineError::Trampoline {
                    tag,
                    source: anyhow::Error::new(e),
                }
            })?;
            let consumed = usize::try_from(reader.position()).expect("cursor position fits usize");
            cursor.advance(consumed);
            f(engine, args).map_err(|source| EngineError::Trampoline { tag, source })
        });
        self.trampolines.push(trampoline);
        Tag(tag)
    }

    pub fn len(&self) -> usize {
        self.trampolines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trampolines.is_empty()
    }

    /// Invokes the trampoline for `tag`, consuming exactly its argument
    /// bytes from `cursor`.
    pub fn dispatch(&self, tag: Tag, engine: &Engine, cursor: &mut FrameCursor<'_>) -> Result<()> {
        let trampoline = self
            .trampolines
            .get(tag.0 as usize)
            .ok_or(EngineError::UnregisteredTag(tag.0))?;
        trampoline(engine, cursor)
    }

    /// Invokes the trampoline for `tag` directly over a standalone argument
    /// byte slice, rather than a cursor positioned inside a larger frame.
    /// Used by the broadcast relay, whose args arrive already unpacked from
    /// a relay frame instead of sitting in a receive buffer.
    pub fn dispatch_raw(&self, tag: Tag, engine: &Engine, args_bytes: &[u8]) -> Result<()> {
        let mut cursor = FrameCursor::new(args_bytes);
        self.dispatch(tag, engine, &mut cursor)
    }
}

/// Serializes `args` into a fresh byte vector using the same encoding the
/// registry's trampolines expect to consume.
pub fn encode_args<Args: serde::Serialize>(args: &Args) -> Result<Vec<u8>> {
    bincode::serialize(args).map_err(|e| EngineError::Invariant(format!("failed to encode args: {e}")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn register_assigns_sequential_tags() {
        let mut registry = LambdaRegistry::new();
        let a = registry.register::<(), _>(|_e, _a| Ok(()));
        let b = registry.register::<(), _>(|_e, _a| Ok(()));
        assert_eq!(a, Tag(0));
        assert_eq!(b, Tag(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn dispatch_unknown_tag_errors() {
        let registry = LambdaRegistry::new();
        let buf = crate::byte_buffer::ByteBuffer::new();
        let mut cursor = FrameCursor::new(buf.data());
        let engine = crate::engine::Engine::new_for_test();
        let err = registry.dispatch(Tag(0), &engine, &mut cursor).unwrap_err();
        assert_matches!(err, EngineError::UnregisteredTag(0));
    }
}
