//! Transactional log of entry movements.
//!
//! Structural mutations move directory entries around; open-file handles
//! hold `(segment, index)` positions that must be rebound afterwards.
//! Rather than keeping back-pointers inside directory data, every mutator
//! records its moves here and the caller receives the net list.
//!
//! Moves are grouped into transactions, one per atomic structural step.
//! Two moves of the same entry inside one transaction stay separate (a
//! block shift moves a whole run of slots at once), but across
//! transactions they fold: `A→B` followed later by `B→C` becomes `A→C`,
//! and an entry that ends up back where it started is dropped entirely.

use crate::ptr::DirPos;
use rt11_types::{E_PERM, E_TENT};
use serde::{Deserialize, Serialize};

/// One net entry movement, reported to the open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMove {
    pub from: DirPos,
    pub to: DirPos,
}

#[derive(Debug, Clone, Copy)]
struct TrackedMove {
    from: DirPos,
    to: DirPos,
    transaction: u32,
}

#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    transaction: u32,
    in_transaction: bool,
    moves: Vec<TrackedMove>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions do not nest.
    pub fn begin(&mut self) {
        debug_assert!(!self.in_transaction);
        self.transaction += 1;
        self.in_transaction = true;
    }

    /// Record that the entry with `status` moved from `from` to `to`.
    ///
    /// Only file entries (tentative or permanent) are of interest to
    /// open-file handles; everything else is ignored.
    pub fn record(&mut self, status: u16, from: DirPos, to: DirPos) {
        debug_assert!(self.in_transaction);

        if status & (E_TENT | E_PERM) == 0 {
            return;
        }

        // an entry already moved by an earlier transaction that is moving
        // again folds into its original record
        let current = self.transaction;
        if let Some(prior) = self
            .moves
            .iter_mut()
            .find(|m| m.to == from && m.transaction != current)
        {
            prior.transaction = current;
            prior.to = to;
            return;
        }

        self.moves.push(TrackedMove {
            from,
            to,
            transaction: current,
        });
    }

    /// Close the transaction, dropping entries that have returned to their
    /// starting position.
    pub fn end(&mut self) {
        debug_assert!(self.in_transaction);
        self.in_transaction = false;
        self.moves.retain(|m| m.from != m.to);
    }

    /// Where the entry originally at `pos` lives now.
    pub fn final_position_of(&self, pos: DirPos) -> DirPos {
        self.moves
            .iter()
            .find(|m| m.from == pos)
            .map_or(pos, |m| m.to)
    }

    pub fn into_moves(self) -> Vec<DirMove> {
        debug_assert!(!self.in_transaction);
        self.moves
            .into_iter()
            .map(|m| DirMove {
                from: m.from,
                to: m.to,
            })
            .collect()
    }
}
