//! Human corrections of presence records and the per-capture error ledger.

use crate::error::{AttendanceError, Entity, Result};
use crate::session;
use crate::types::{CaptureId, ErrorLedger, MemberId};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

/// What a correction says about the matcher's original decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Marked present, actually absent.
    FalsePositive,
    /// Marked absent, actually present.
    FalseNegative,
    /// The correction confirms the stored status.
    Unchanged,
}

impl Correction {
    pub fn classify(old: bool, new: bool) -> Self {
        match (old, new) {
            (true, false) => Self::FalsePositive,
            (false, true) => Self::FalseNegative,
            _ => Self::Unchanged,
        }
    }
}

impl ErrorLedger {
    /// Ledger after recording `correction`.
    pub fn record(self, correction: Correction) -> Self {
        match correction {
            Correction::FalsePositive => Self {
                false_positive_count: self.false_positive_count + 1,
                ..self
            },
            Correction::FalseNegative => Self {
                false_negative_count: self.false_negative_count + 1,
                ..self
            },
            Correction::Unchanged => self,
        }
    }
}

/// Set one member's presence in a capture and count the matcher's mistake.
///
/// Never creates a presence record. Counter increments happen in SQL inside
/// the caller's transaction, so concurrent corrections cannot lose updates.
/// Returns the ledger as it stands after this correction.
pub fn correct(
    tx: &Transaction<'_>,
    capture_id: CaptureId,
    member_id: MemberId,
    present: bool,
) -> Result<ErrorLedger> {
    let before = error_ledger(tx, capture_id)?;

    let old: bool = tx
        .query_row(
            "SELECT present FROM presence_records WHERE capture_id = ?1 AND member_id = ?2",
            params![capture_id, member_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| {
            AttendanceError::not_found(
                Entity::PresenceRecord,
                format!("member {member_id} in capture {capture_id}"),
            )
        })?;

    let correction = Correction::classify(old, present);
    let column = match correction {
        Correction::FalsePositive => Some("false_positive_count"),
        Correction::FalseNegative => Some("false_negative_count"),
        Correction::Unchanged => None,
    };
    if let Some(column) = column {
        tx.execute(
            &format!("UPDATE error_ledgers SET {column} = {column} + 1 WHERE capture_id = ?1"),
            [capture_id],
        )?;
    }

    tx.execute(
        "UPDATE presence_records SET present = ?3 WHERE capture_id = ?1 AND member_id = ?2",
        params![capture_id, member_id, present],
    )?;

    let ledger = before.record(correction);
    tracing::info!(
        capture_id,
        member_id,
        present,
        ?correction,
        false_positives = ledger.false_positive_count,
        false_negatives = ledger.false_negative_count,
        "presence corrected"
    );
    Ok(ledger)
}

pub fn error_ledger(conn: &Connection, capture_id: CaptureId) -> Result<ErrorLedger> {
    session::capture(conn, capture_id)?;
    conn.query_row(
        "SELECT false_positive_count, false_negative_count FROM error_ledgers WHERE capture_id = ?1",
        [capture_id],
        |row| {
            Ok(ErrorLedger {
                false_positive_count: row.get(0)?,
                false_negative_count: row.get(1)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AttendanceError::not_found(Entity::ErrorLedger, capture_id))
}
