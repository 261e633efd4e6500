//! Session state
//!
//! An explicit value owning the current pending index, the monotonic
//! generation counter, and the candidate lifecycle state machine:
//! awaiting_candidates → candidates_ready → (accepted | ignored | skipped)
//! → awaiting_candidates. Every ledger or pending-pool mutation bumps the
//! generation; commands carrying an older generation are rejected with a
//! retriable stale signal.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Candidate lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    AwaitingCandidates,
    CandidatesReady,
    Accepted,
    Ignored,
    Skipped,
}

/// Per-engine session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    generation: u64,
    pending_index: usize,
    phase: SessionPhase,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            generation: 0,
            pending_index: 0,
            phase: SessionPhase::AwaitingCandidates,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_index(&self) -> usize {
        self.pending_index
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Reject commands computed against an older generation
    pub fn check_generation(&self, generation: u64) -> Result<(), CoreError> {
        if generation != self.generation {
            return Err(CoreError::StaleGeneration {
                expected: self.generation,
                actual: generation,
            });
        }
        Ok(())
    }

    /// A candidate set for the current generation has been computed
    pub fn mark_ready(&mut self) {
        self.phase = SessionPhase::CandidatesReady;
    }

    /// A candidate was accepted; the pool shrank, so the index stays put
    /// and now addresses the next entry.
    pub fn record_accept(&mut self, pending_len: usize) {
        self.generation += 1;
        self.phase = SessionPhase::Accepted;
        self.clamp_index(pending_len);
    }

    /// A candidate was ignored; same bookkeeping as accept
    pub fn record_ignore(&mut self, pending_len: usize) {
        self.generation += 1;
        self.phase = SessionPhase::Ignored;
        self.clamp_index(pending_len);
    }

    /// Advance past the current entry without mutating anything.
    /// Fully reversible via `set_index`.
    pub fn record_skip(&mut self, pending_len: usize) {
        if pending_len > 0 {
            self.pending_index = (self.pending_index + 1) % pending_len;
        }
        self.phase = SessionPhase::Skipped;
    }

    /// Jump to a pending entry (UI navigation)
    pub fn set_index(&mut self, index: usize, pending_len: usize) -> Result<(), CoreError> {
        if pending_len > 0 && index >= pending_len {
            return Err(CoreError::PendingNotFound { index });
        }
        self.pending_index = index.min(pending_len.saturating_sub(1));
        self.phase = SessionPhase::AwaitingCandidates;
        Ok(())
    }

    /// Any other mutation of ledger or pool state (reload, retrain,
    /// external edit)
    pub fn record_mutation(&mut self) {
        self.generation += 1;
        self.phase = SessionPhase::AwaitingCandidates;
    }

    fn clamp_index(&mut self, pending_len: usize) {
        self.pending_index = self.pending_index.min(pending_len.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_is_rejected() {
        let mut session = Session::new();
        session.record_mutation();
        let err = session.check_generation(0).unwrap_err();
        assert!(matches!(
            err,
            CoreError::StaleGeneration {
                expected: 1,
                actual: 0
            }
        ));
        assert!(err.is_retriable());
        assert!(session.check_generation(1).is_ok());
    }

    #[test]
    fn accept_bumps_generation_and_clamps_index() {
        let mut session = Session::new();
        session.mark_ready();
        assert_eq!(session.phase(), SessionPhase::CandidatesReady);
        session.set_index(4, 5).unwrap();
        session.record_accept(4);
        assert_eq!(session.generation(), 1);
        assert_eq!(session.phase(), SessionPhase::Accepted);
        assert_eq!(session.pending_index(), 3);
    }

    #[test]
    fn skip_wraps_without_bumping_generation() {
        let mut session = Session::new();
        session.record_skip(2);
        assert_eq!(session.pending_index(), 1);
        session.record_skip(2);
        assert_eq!(session.pending_index(), 0);
        assert_eq!(session.generation(), 0);
        assert_eq!(session.phase(), SessionPhase::Skipped);
    }

    #[test]
    fn set_index_rejects_out_of_range() {
        let mut session = Session::new();
        assert!(matches!(
            session.set_index(3, 2),
            Err(CoreError::PendingNotFound { index: 3 })
        ));
        session.set_index(1, 2).unwrap();
        assert_eq!(session.pending_index(), 1);
    }
}
