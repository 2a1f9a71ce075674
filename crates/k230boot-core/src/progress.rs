//! Boot progress reporting
//!
//! The session reports through [`BootProgress`] so front-ends can draw
//! progress bars without the core depending on any terminal crate.

use crate::sequencer::StageWrite;
use crate::session::{SessionState, SessionSummary};

/// Receives progress events from a running session
///
/// All methods default to no-ops.
pub trait BootProgress {
    /// The session moved to a new state
    fn state_changed(&mut self, _state: SessionState) {}

    /// A stage is about to be written
    fn stage_started(&mut self, _index: usize, _stage: &StageWrite) {}

    /// Bytes of the current stage written so far
    fn stage_progress(&mut self, _index: usize, _written: usize, _total: usize) {}

    /// A stage has been fully written (and called, if it trains DRAM)
    fn stage_completed(&mut self, _index: usize, _stage: &StageWrite) {}

    /// The boot finished
    fn complete(&mut self, _summary: &SessionSummary) {}
}

/// Progress sink that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl BootProgress for NoProgress {}
