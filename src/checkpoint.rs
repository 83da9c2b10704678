//! Checkpoint save/load interface (§6).
//!
//! Persistent state is a stream of `(context-name, (key, value)*)` records;
//! the stream itself — where it goes, how context boundaries are framed on
//! disk or over a socket — is the host's problem, named explicitly out of
//! scope alongside the other checkpoint backends. What this crate owns is
//! the per-subsystem contract: every checkpointable piece of VM state
//! exposes `save`/`load` against a context the host supplies.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint context is missing required key {0:?}")]
    MissingKey(String),
    #[error("checkpoint value for key {0:?} has the wrong length: expected {1}, got {2}")]
    WrongLength(String, usize, usize),
}

/// One context boundary in the checkpoint stream: a flat key/value
/// namespace a subsystem writes its state into (on save) or reads it back
/// from (on load). Byte ordering follows the host; this crate does not
/// promise cross-host portability (§6).
pub trait CheckpointContext {
    fn write(&mut self, key: &str, value: &[u8]);
    fn read(&self, key: &str) -> Option<&[u8]>;
}

/// Anything that participates in a checkpoint.
pub trait Checkpointable {
    fn save(&self, ctx: &mut dyn CheckpointContext);
    fn load(&mut self, ctx: &dyn CheckpointContext) -> Result<(), CheckpointError>;
}

fn read_u64(ctx: &dyn CheckpointContext, key: &str) -> Result<u64, CheckpointError> {
    let bytes = ctx
        .read(key)
        .ok_or_else(|| CheckpointError::MissingKey(key.to_string()))?;
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CheckpointError::WrongLength(key.to_string(), 8, bytes.len()))?;
    Ok(u64::from_le_bytes(array))
}

impl Checkpointable for crate::time::TscState {
    fn save(&self, ctx: &mut dyn CheckpointContext) {
        ctx.write("tsc_offset", &self.offset().to_le_bytes());
    }

    fn load(&mut self, ctx: &dyn CheckpointContext) -> Result<(), CheckpointError> {
        let offset = read_u64(ctx, "tsc_offset")? as i64;
        // Rebasing against (0, offset) reproduces the saved offset exactly,
        // since `rebase(host_tsc, target)` sets `offset = target - host_tsc`.
        self.rebase(0, offset as u64);
        Ok(())
    }
}

/// A flat in-memory context, used by tests and small standalone demos —
/// not a real checkpoint backend, which the host supplies (§6's "all
/// telemetry and checkpoint backends" are out of scope here).
#[derive(Default)]
pub struct MemoryCheckpointContext {
    entries: std::collections::BTreeMap<String, Vec<u8>>,
}

impl MemoryCheckpointContext {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointContext for MemoryCheckpointContext {
    fn write(&mut self, key: &str, value: &[u8]) {
        self.entries.insert(key.to_string(), value.to_vec());
    }

    fn read(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TscState;

    #[test]
    fn tsc_state_round_trips_through_a_checkpoint() {
        let mut original = TscState::new();
        original.rebase(1000, 42);
        let mut ctx = MemoryCheckpointContext::new();
        original.save(&mut ctx);

        let mut restored = TscState::new();
        restored.load(&ctx).unwrap();
        assert_eq!(restored.offset(), original.offset());
    }

    #[test]
    fn missing_key_on_load_is_reported() {
        let ctx = MemoryCheckpointContext::new();
        let mut state = TscState::new();
        assert!(matches!(
            state.load(&ctx),
            Err(CheckpointError::MissingKey(_))
        ));
    }
}


