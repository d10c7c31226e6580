//! Atomic, invertible text edits and position mapping.
//!
//! A [`Step`] replaces the byte range `[from, to)` of a document with
//! `insert`. Steps are immutable once created, can be inverted against the
//! document they were made for, and can be mapped through the edits of other
//! clients so that unconfirmed local work re-applies cleanly on top of steps
//! that landed first ([`rebase_steps`]).
//!
//! # Responsibilities
//!
//! - Validate and apply a step to a document (whole-batch callers rely on
//!   apply failing without touching the input).
//! - Invert a step against its pre-application document for rewinding.
//! - Map positions through concurrent edits: an insertion point at the same
//!   position as a committed insert lands after it, text inserted at the
//!   boundary of a concurrent deletion survives it, and a step whose entire
//!   range was deleted is dropped.
//!
//! # Example
//!
//! ```ignore
//! let step = Step::new(0, 0, "hello");
//! let doc = step.apply("")?;
//! assert_eq!(doc, "hello");
//! let undo = step.invert("")?;
//! assert_eq!(undo.apply(&doc)?, "");
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CollabError, Result};

/// An atomic replace-range edit: substitute `[from, to)` with `insert`.
///
/// Offsets are byte positions and must fall on UTF-8 character boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Step {
    /// Start of the replaced range (inclusive, byte offset)
    pub from: usize,

    /// End of the replaced range (exclusive, byte offset)
    pub to: usize,

    /// Replacement text (empty for a pure deletion)
    pub insert: String,
}

/// Which side a mapped position sticks to when content is inserted exactly
/// at that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    /// Stay before the inserted content
    Before,
    /// Move after the inserted content
    After,
}

/// Result of mapping one position through a [`StepMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPos {
    /// The position in the post-step document
    pub pos: usize,
    /// True when the position sat strictly inside the replaced range
    pub deleted: bool,
}

/// The positional effect of one step: `old_size` bytes at `start` became
/// `new_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepMap {
    /// Start of the affected range
    pub start: usize,
    /// Length of the replaced range in the old document
    pub old_size: usize,
    /// Length of the replacement in the new document
    pub new_size: usize,
}

impl StepMap {
    /// Map a position in the pre-step document to the post-step document.
    pub fn map_pos(&self, pos: usize, assoc: Assoc) -> MappedPos {
        let end = self.start + self.old_size;
        if pos < self.start {
            return MappedPos { pos, deleted: false };
        }
        if pos > end {
            return MappedPos {
                pos: pos + self.new_size - self.old_size,
                deleted: false,
            };
        }
        // Inside or on the boundary of the replaced range. Boundary
        // positions keep their side; interior positions follow `assoc` and
        // are flagged as deleted.
        let side = if self.old_size == 0 {
            assoc
        } else if pos == self.start {
            Assoc::Before
        } else if pos == end {
            Assoc::After
        } else {
            assoc
        };
        let mapped = match side {
            Assoc::Before => self.start,
            Assoc::After => self.start + self.new_size,
        };
        MappedPos {
            pos: mapped,
            deleted: self.old_size > 0 && pos > self.start && pos < end,
        }
    }
}

impl Step {
    /// Create a step replacing `[from, to)` with `insert`.
    pub fn new(from: usize, to: usize, insert: impl Into<String>) -> Self {
        Self {
            from,
            to,
            insert: insert.into(),
        }
    }

    /// Convenience constructor for a pure insertion at `pos`.
    pub fn insert_at(pos: usize, insert: impl Into<String>) -> Self {
        Self::new(pos, pos, insert)
    }

    /// Convenience constructor for a pure deletion of `[from, to)`.
    pub fn delete(from: usize, to: usize) -> Self {
        Self::new(from, to, "")
    }

    fn check(&self, doc: &str) -> Result<()> {
        if self.from > self.to {
            return Err(CollabError::InvalidStep(format!(
                "range start {} is past range end {}",
                self.from, self.to
            )));
        }
        if self.to > doc.len() {
            return Err(CollabError::InvalidStep(format!(
                "range end {} is past document length {}",
                self.to,
                doc.len()
            )));
        }
        if !doc.is_char_boundary(self.from) || !doc.is_char_boundary(self.to) {
            return Err(CollabError::InvalidStep(format!(
                "range [{}, {}) does not fall on character boundaries",
                self.from, self.to
            )));
        }
        Ok(())
    }

    /// Apply this step to `doc`, producing the new document.
    ///
    /// Fails without side effects when the range is out of bounds or not on
    /// character boundaries, so batch callers can validate by applying to a
    /// scratch copy.
    pub fn apply(&self, doc: &str) -> Result<String> {
        self.check(doc)?;
        let mut out = String::with_capacity(doc.len() + self.insert.len());
        out.push_str(&doc[..self.from]);
        out.push_str(&self.insert);
        out.push_str(&doc[self.to..]);
        Ok(out)
    }

    /// Invert this step against the document it was made for.
    ///
    /// Applying the inverse to `self.apply(doc_before)` restores
    /// `doc_before`.
    pub fn invert(&self, doc_before: &str) -> Result<Step> {
        self.check(doc_before)?;
        Ok(Step {
            from: self.from,
            to: self.from + self.insert.len(),
            insert: doc_before[self.from..self.to].to_string(),
        })
    }

    /// The positional effect of this step.
    pub fn step_map(&self) -> StepMap {
        StepMap {
            start: self.from,
            old_size: self.to - self.from,
            new_size: self.insert.len(),
        }
    }

    /// Map this step through the effects of steps that applied after it was
    /// created. Returns `None` when the step's range was entirely deleted.
    ///
    /// The range start sticks after concurrent inserts at the same position
    /// (so the first-committed edit keeps the earlier slot) and the range end
    /// sticks before them (so text inserted at either boundary of a deletion
    /// survives it).
    pub fn map_through(&self, maps: &[StepMap]) -> Option<Step> {
        let pure_insert = self.from == self.to;
        let mut from = self.from;
        let mut to = self.to;
        let mut from_deleted = false;
        let mut to_deleted = false;
        for map in maps {
            let mapped_from = map.map_pos(from, Assoc::After);
            from = mapped_from.pos;
            from_deleted |= mapped_from.deleted;
            if pure_insert {
                to = from;
                to_deleted = from_deleted;
            } else {
                let mapped_to = map.map_pos(to, Assoc::Before);
                to = mapped_to.pos;
                to_deleted |= mapped_to.deleted;
            }
        }
        if from_deleted && to_deleted {
            return None;
        }
        Some(Step {
            from,
            to: to.max(from),
            insert: self.insert.clone(),
        })
    }
}

/// A locally applied, not yet confirmed step together with its inverse.
///
/// The inverse is captured at application time so the client can rewind its
/// document to the last confirmed state when rebasing.
#[derive(Debug, Clone)]
pub struct Rebaseable {
    /// The unconfirmed step
    pub step: Step,
    /// Inverse of `step` against the document it was applied to
    pub inverted: Step,
}

/// Outcome of rebasing unconfirmed steps over remote ones.
#[derive(Debug, Clone)]
pub struct RebaseResult {
    /// The document with remote steps and the surviving unconfirmed steps applied
    pub doc: String,
    /// The surviving unconfirmed steps, re-mapped, with fresh inverses
    pub pending: Vec<Rebaseable>,
    /// How many unconfirmed steps no longer applied and were dropped
    pub dropped: usize,
}

/// Rebase unconfirmed local steps on top of remote steps that landed first.
///
/// `doc` is the local document with all of `pending` applied. The procedure
/// rewinds `pending` via the stored inverses, applies `remote` to the
/// confirmed base, then re-maps and re-applies each pending step in order.
/// Steps whose positions were consumed by remote edits are dropped, matching
/// the editing framework's rebase contract.
pub fn rebase_steps(doc: &str, pending: &[Rebaseable], remote: &[Step]) -> Result<RebaseResult> {
    // Rewind to the last confirmed document.
    let mut current = doc.to_string();
    for entry in pending.iter().rev() {
        current = entry.inverted.apply(&current)?;
    }

    // Maps in application order: the rewound inverses (newest first), then
    // the remote steps, then each re-applied pending step as it lands.
    let mut maps: Vec<StepMap> = pending
        .iter()
        .rev()
        .map(|entry| entry.inverted.step_map())
        .collect();

    for step in remote {
        current = step.apply(&current)?;
        maps.push(step.step_map());
    }

    let rewound = pending.len();
    let mut survivors = Vec::with_capacity(pending.len());
    let mut dropped = 0;
    for (index, entry) in pending.iter().enumerate() {
        // A pending step's coordinates are valid just before its own rewind
        // entry, so it maps through everything from that point on.
        let slice = &maps[rewound - index..];
        let mapped = entry.step.map_through(slice);
        match mapped {
            Some(step) => match step.invert(&current) {
                Ok(inverted) => {
                    current = step.apply(&current)?;
                    maps.push(step.step_map());
                    survivors.push(Rebaseable { step, inverted });
                }
                Err(_) => dropped += 1,
            },
            None => dropped += 1,
        }
    }

    Ok(RebaseResult {
        doc: current,
        pending: survivors,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebaseable(step: Step, doc_before: &str) -> Rebaseable {
        let inverted = step.invert(doc_before).unwrap();
        Rebaseable { step, inverted }
    }

    #[test]
    fn test_apply_insert_delete_replace() {
        assert_eq!(Step::insert_at(0, "hi ").apply("there").unwrap(), "hi there");
        assert_eq!(Step::delete(0, 3).apply("hi there").unwrap(), "there");
        assert_eq!(Step::new(3, 8, "world").apply("hi there").unwrap(), "hi world");
    }

    #[test]
    fn test_apply_out_of_bounds() {
        let err = Step::new(0, 10, "x").apply("short").unwrap_err();
        assert!(matches!(err, CollabError::InvalidStep(_)));
        let err = Step::new(4, 2, "x").apply("short").unwrap_err();
        assert!(matches!(err, CollabError::InvalidStep(_)));
    }

    #[test]
    fn test_apply_rejects_split_characters() {
        // 'é' occupies bytes 1..3
        let err = Step::new(2, 3, "x").apply("héllo").unwrap_err();
        assert!(matches!(err, CollabError::InvalidStep(_)));
        // Replacing the full character is fine
        assert_eq!(Step::new(1, 3, "e").apply("héllo").unwrap(), "hello");
    }

    #[test]
    fn test_invert_round_trips() {
        let doc = "hello world";
        let step = Step::new(6, 11, "rust");
        let after = step.apply(doc).unwrap();
        assert_eq!(after, "hello rust");
        let undo = step.invert(doc).unwrap();
        assert_eq!(undo.apply(&after).unwrap(), doc);
    }

    #[test]
    fn test_map_pos_around_insert() {
        let map = Step::insert_at(3, "abc").step_map();
        assert_eq!(map.map_pos(1, Assoc::After).pos, 1);
        assert_eq!(map.map_pos(5, Assoc::After).pos, 8);
        // At the insertion point the association decides the side
        assert_eq!(map.map_pos(3, Assoc::Before).pos, 3);
        assert_eq!(map.map_pos(3, Assoc::After).pos, 6);
    }

    #[test]
    fn test_map_pos_inside_deletion() {
        let map = Step::delete(2, 6).step_map();
        let mapped = map.map_pos(4, Assoc::After);
        assert_eq!(mapped.pos, 2);
        assert!(mapped.deleted);
        // Boundaries are not considered deleted
        assert!(!map.map_pos(2, Assoc::After).deleted);
        assert!(!map.map_pos(6, Assoc::Before).deleted);
    }

    #[test]
    fn test_concurrent_inserts_at_same_position() {
        // A committed insert at 0; a second insert at 0 maps after it.
        let committed = Step::insert_at(0, "A");
        let mapped = Step::insert_at(0, "B")
            .map_through(&[committed.step_map()])
            .unwrap();
        assert_eq!(mapped, Step::insert_at(1, "B"));

        let doc = committed.apply("").unwrap();
        assert_eq!(mapped.apply(&doc).unwrap(), "AB");
    }

    #[test]
    fn test_deletion_spares_boundary_inserts() {
        // Text inserted exactly at a deletion's start boundary survives it.
        let insert = Step::insert_at(0, "->");
        let mapped = Step::delete(0, 5).map_through(&[insert.step_map()]).unwrap();
        assert_eq!(mapped, Step::delete(2, 7));
        let doc = insert.apply("hello").unwrap();
        assert_eq!(mapped.apply(&doc).unwrap(), "->");

        // Same at the end boundary.
        let insert = Step::insert_at(5, "->");
        let mapped = Step::delete(0, 5).map_through(&[insert.step_map()]).unwrap();
        assert_eq!(mapped, Step::delete(0, 5));
        let doc = insert.apply("hello").unwrap();
        assert_eq!(mapped.apply(&doc).unwrap(), "->");
    }

    #[test]
    fn test_deletion_extends_over_interior_insert() {
        // Text inserted strictly inside a deleted range is consumed with it.
        let insert = Step::insert_at(2, "->");
        let mapped = Step::delete(0, 5).map_through(&[insert.step_map()]).unwrap();
        assert_eq!(mapped, Step::delete(0, 7));
        let doc = insert.apply("hello").unwrap();
        assert_eq!(mapped.apply(&doc).unwrap(), "");
    }

    #[test]
    fn test_step_inside_deleted_range_is_dropped() {
        let wipe = Step::delete(0, 10);
        assert!(Step::new(2, 5, "x").map_through(&[wipe.step_map()]).is_none());
        // A pure insert anchored inside the wiped range is dropped too
        assert!(Step::insert_at(4, "x").map_through(&[wipe.step_map()]).is_none());
    }

    #[test]
    fn test_replacing_same_range_keeps_later_insert() {
        // Both clients replace [2, 5); the later one collapses to an insert.
        let committed = Step::new(2, 5, "");
        let mapped = Step::new(2, 5, "xyz")
            .map_through(&[committed.step_map()])
            .unwrap();
        assert_eq!(mapped, Step::new(2, 2, "xyz"));
    }

    #[test]
    fn test_rebase_single_pending_over_remote() {
        // Local typed "B" at 0 against the empty doc; remote committed "A"
        // at 0 first. The rebased local step lands after it.
        let pending = vec![rebaseable(Step::insert_at(0, "B"), "")];
        let local_doc = "B";
        let remote = vec![Step::insert_at(0, "A")];

        let result = rebase_steps(local_doc, &pending, &remote).unwrap();
        assert_eq!(result.doc, "AB");
        assert_eq!(result.pending.len(), 1);
        assert_eq!(result.pending[0].step, Step::insert_at(1, "B"));
        assert_eq!(result.dropped, 0);
    }

    #[test]
    fn test_rebase_multiple_pending_steps() {
        // Base "0123", local appended "x" then "y" at the end, remote
        // prepended "R".
        let base = "0123";
        let first = Step::insert_at(4, "x");
        let doc1 = first.apply(base).unwrap();
        let second = Step::insert_at(5, "y");
        let doc2 = second.apply(&doc1).unwrap();
        assert_eq!(doc2, "0123xy");

        let pending = vec![rebaseable(first, base), rebaseable(second, &doc1)];
        let remote = vec![Step::insert_at(0, "R")];

        let result = rebase_steps(&doc2, &pending, &remote).unwrap();
        assert_eq!(result.doc, "R0123xy");
        assert_eq!(result.pending[0].step, Step::insert_at(5, "x"));
        assert_eq!(result.pending[1].step, Step::insert_at(6, "y"));
    }

    #[test]
    fn test_rebase_drops_step_in_deleted_region() {
        // Local edited inside a region the remote deleted wholesale.
        let base = "abcdefgh";
        let local = Step::new(3, 5, "X");
        let local_doc = local.apply(base).unwrap();
        let pending = vec![rebaseable(local, base)];
        let remote = vec![Step::delete(1, 8)];

        let result = rebase_steps(&local_doc, &pending, &remote).unwrap();
        assert_eq!(result.doc, "a");
        assert!(result.pending.is_empty());
        assert_eq!(result.dropped, 1);
    }

    #[test]
    fn test_rebase_with_no_pending_applies_remote() {
        let result = rebase_steps("abc", &[], &[Step::insert_at(3, "!")]).unwrap();
        assert_eq!(result.doc, "abc!");
        assert!(result.pending.is_empty());
    }

    #[test]
    fn test_rebase_inverses_restore_confirmed_doc() {
        // The fresh inverses must rewind the rebased doc back to the
        // remote-confirmed base.
        let base = "hello";
        let local = Step::insert_at(5, "!");
        let local_doc = local.apply(base).unwrap();
        let pending = vec![rebaseable(local, base)];
        let remote = vec![Step::insert_at(0, ">> ")];

        let result = rebase_steps(&local_doc, &pending, &remote).unwrap();
        assert_eq!(result.doc, ">> hello!");
        let rewound = result.pending[0].inverted.apply(&result.doc).unwrap();
        assert_eq!(rewound, ">> hello");
    }
}
