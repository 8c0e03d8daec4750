//! State machine port.
//!
//! The application supplies the state machine; the core only promises that
//! `apply` is called at most once per log index, in index order, and only for
//! committed entries.

use crate::error::Result;
use bytes::Bytes;

/// User-supplied replicated state machine.
pub trait StateMachine: Send {
    /// Apply a committed command payload.
    ///
    /// Called exactly once per index, in index order. An error aborts the
    /// apply loop at that index; it is retried on the next commit advance.
    fn apply(&mut self, command: &[u8]) -> Result<()>;

    /// Serialize the applied prefix into snapshot bytes.
    fn serialize(&self) -> Result<Bytes>;
}

/// Trivial state machine that records applied commands. Test helper.
#[derive(Debug, Default)]
pub struct VecStateMachine {
    pub applied: Vec<Bytes>,
}

impl StateMachine for VecStateMachine {
    fn apply(&mut self, command: &[u8]) -> Result<()> {
        self.applied.push(Bytes::copy_from_slice(command));
        Ok(())
    }

    fn serialize(&self) -> Result<Bytes> {
        let encoded = bincode::serialize(&self.applied.iter().map(|b| b.to_vec()).collect::<Vec<_>>())?;
        Ok(Bytes::from(encoded))
    }
}
