//! Operational-transform engine for concurrent text edits.
//!
//! Pure and side-effect free: given an operation that was intended against
//! an older document state, [`transform`] rewrites it to apply after another
//! operation has already landed, so that every replica converges on the same
//! content regardless of arrival order.
//!
//! ```text
//!         site A                    hub                     site B
//!   insert(1,"X") ──────────► apply, log ──────────► insert(1,"X")
//!                             ▲
//!   insert(1,"Y") ────────────┘ transform against log
//!                             └──► apply insert(2,"Y") ──► both sites: "aXYb"
//! ```
//!
//! Positions are UTF-16 code-unit offsets, matching editor widget
//! semantics. The engine never fails: out-of-range positions are clamped by
//! [`apply`] and the caller logs the clamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single user-originated edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// Insert `text` at `position` (0-based code-unit offset).
    Insert {
        position: usize,
        text: String,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    /// Delete `length` code units starting at `position`.
    Delete {
        position: usize,
        length: usize,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl Operation {
    pub fn insert(
        position: usize,
        text: impl Into<String>,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Operation::Insert {
            position,
            text: text.into(),
            user_id,
            timestamp,
        }
    }

    pub fn delete(position: usize, length: usize, user_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Operation::Delete {
            position,
            length,
            user_id,
            timestamp,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            Operation::Insert { user_id, .. } | Operation::Delete { user_id, .. } => *user_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Operation::Insert { timestamp, .. } | Operation::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Operation::Insert { position, .. } | Operation::Delete { position, .. } => *position,
        }
    }

    /// An operation that changes nothing. No-ops are still logged so that
    /// later arrivals transform against the full concurrent window.
    pub fn is_noop(&self) -> bool {
        match self {
            Operation::Insert { text, .. } => text.is_empty(),
            Operation::Delete { length, .. } => *length == 0,
        }
    }
}

/// Length of a string in UTF-16 code units.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Rewrite `op_a` to apply after `op_b` has already been applied.
///
/// The concurrent intent of `op_a` is preserved: applying the result on top
/// of `op_b`'s effect yields what both users together meant. The 2x2
/// cross-product of insert/delete is handled exhaustively; ties at the same
/// position break on the client timestamp, then on user id so the function
/// stays deterministic.
pub fn transform(op_a: &Operation, op_b: &Operation) -> Operation {
    let mut out = op_a.clone();
    match (&mut out, op_b) {
        (
            Operation::Insert {
                position: p1,
                user_id: u1,
                timestamp: t1,
                ..
            },
            Operation::Insert {
                position: p2,
                text: t2_text,
                user_id: u2,
                timestamp: t2,
            },
        ) => {
            let shift = utf16_len(t2_text);
            if *p1 > *p2 {
                *p1 += shift;
            } else if *p1 == *p2 {
                // Lower timestamp keeps the position; the later insert
                // lands after it. Equal timestamps order by user id.
                let a_first = (*t1, *u1) < (*t2, *u2);
                if !a_first {
                    *p1 += shift;
                }
            }
        }

        (
            Operation::Delete {
                position: p1,
                length: l1,
                ..
            },
            Operation::Delete {
                position: p2,
                length: l2,
                ..
            },
        ) => {
            if *p1 > *p2 {
                *p1 = (*p1).saturating_sub(*l2).max(*p2);
            } else if *p1 == *p2 {
                if *l1 > *l2 {
                    *l1 -= *l2;
                } else {
                    // Equal or shorter range: everything this delete wanted
                    // is already gone. Collapsing to a no-op (for either
                    // timestamp order) is what keeps both sites converged;
                    // the no-op is still recorded in the log.
                    *l1 = 0;
                }
            }
        }

        (
            Operation::Insert { position: p1, .. },
            Operation::Delete {
                position: p2,
                length: l2,
                ..
            },
        ) => {
            if *p1 > *p2 + *l2 {
                *p1 -= *l2;
            } else if *p1 > *p2 {
                // Insert fell inside the deleted window: collapse to its
                // left edge.
                *p1 = *p2;
            }
        }

        (
            Operation::Delete { position: p1, .. },
            Operation::Insert {
                position: p2,
                text: t2_text,
                ..
            },
        ) => {
            if *p1 >= *p2 {
                *p1 += utf16_len(t2_text);
            }
        }
    }
    out
}

/// Fold [`transform`] over a concurrent window, preserving list order.
pub fn transform_against(op: &Operation, window: &[Operation]) -> Operation {
    window
        .iter()
        .fold(op.clone(), |acc, prior| transform(&acc, prior))
}

/// Apply an operation to document content, returning the new content.
///
/// Pathological positions are clamped into `[0, |content|]`; the caller is
/// expected to log when [`exceeds_bounds`] reports a clamp. No-ops return
/// the content unchanged.
pub fn apply(content: &str, op: &Operation) -> String {
    if op.is_noop() {
        return content.to_string();
    }
    let mut units: Vec<u16> = content.encode_utf16().collect();
    match op {
        Operation::Insert { position, text, .. } => {
            let at = (*position).min(units.len());
            let insert_units: Vec<u16> = text.encode_utf16().collect();
            units.splice(at..at, insert_units);
        }
        Operation::Delete {
            position, length, ..
        } => {
            let start = (*position).min(units.len());
            let end = start.saturating_add(*length).min(units.len());
            units.drain(start..end);
        }
    }
    String::from_utf16_lossy(&units)
}

/// Whether applying `op` to `content` would clamp its position or length.
pub fn exceeds_bounds(content: &str, op: &Operation) -> bool {
    let len = utf16_len(content);
    match op {
        Operation::Insert { position, .. } => *position > len,
        Operation::Delete {
            position, length, ..
        } => position.saturating_add(*length) > len,
    }
}

/// Merge adjacent operations by the same user, preserving order otherwise.
///
/// Two inserts merge when the second continues exactly where the first
/// ended; two deletes merge when they name the same position (repeated
/// forward-deletes). Used to compact the operation log.
pub fn compose(sequence: &[Operation]) -> Vec<Operation> {
    let mut out: Vec<Operation> = Vec::with_capacity(sequence.len());
    for op in sequence {
        if let Some(merged) = out.last().and_then(|prev| merge_pair(prev, op)) {
            *out.last_mut().unwrap() = merged;
        } else {
            out.push(op.clone());
        }
    }
    out
}

fn merge_pair(prev: &Operation, next: &Operation) -> Option<Operation> {
    if prev.user_id() != next.user_id() {
        return None;
    }
    match (prev, next) {
        (
            Operation::Insert {
                position: p1,
                text: t1,
                user_id,
                timestamp,
            },
            Operation::Insert {
                position: p2,
                text: t2,
                ..
            },
        ) if p1 + utf16_len(t1) == *p2 => Some(Operation::Insert {
            position: *p1,
            text: format!("{t1}{t2}"),
            user_id: *user_id,
            timestamp: *timestamp,
        }),
        (
            Operation::Delete {
                position: p1,
                length: l1,
                user_id,
                timestamp,
            },
            Operation::Delete {
                position: p2,
                length: l2,
                ..
            },
        ) if p1 == p2 => Some(Operation::Delete {
            position: *p1,
            length: l1 + l2,
            user_id: *user_id,
            timestamp: *timestamp,
        }),
        _ => None,
    }
}
