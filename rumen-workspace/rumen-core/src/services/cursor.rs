use serde::{Deserialize, Serialize};

use crate::error::RumenError;

/// Marks which turns have been folded into the belief store.
///
/// Records with `turn <= last_committed_turn` are folded; records in
/// `(last_committed_turn, current_turn]` are pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitCursor {
    last_committed_turn: u64,
}

impl CommitCursor {
    pub fn new(last_committed_turn: u64) -> Self {
        Self { last_committed_turn }
    }

    pub fn last_committed_turn(&self) -> u64 {
        self.last_committed_turn
    }

    pub fn is_folded(&self, turn: u64) -> bool {
        turn <= self.last_committed_turn
    }

    /// Half-open `(min_exclusive, max_inclusive]` bounds of the pending batch,
    /// or `None` when nothing can be pending.
    pub fn pending_range(&self, current_turn: u64) -> Option<(u64, u64)> {
        (current_turn > self.last_committed_turn).then_some((self.last_committed_turn, current_turn))
    }

    /// Move the cursor to `turn`. Standing still is allowed, moving back is not.
    pub fn advance(&mut self, turn: u64) -> Result<(), RumenError> {
        if turn < self.last_committed_turn {
            return Err(RumenError::CursorRegression {
                current: self.last_committed_turn,
                requested: turn,
            });
        }
        self.last_committed_turn = turn;
        Ok(())
    }

    /// Lowest turn compaction must keep: records with `turn > floor` survive.
    pub fn retention_floor(&self, retention_turns: u64) -> u64 {
        self.last_committed_turn.saturating_sub(retention_turns)
    }
}
