use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

pub const MODULE_MIN: i64 = 1;
pub const MODULE_MAX: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Upcoming,
    Active,
    Completed,
}

impl BatchStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upcoming" => Some(Self::Upcoming),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

/// Student-side effect of a batch status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    None,
    /// Completing a batch force-deactivates every student in it,
    /// regardless of their prior flag.
    DeactivateStudents,
    /// Reactivating a completed batch force-reactivates every student in it.
    ReactivateStudents,
}

pub fn cascade_for(old: BatchStatus, new: BatchStatus) -> Cascade {
    if old == new {
        return Cascade::None;
    }
    if new == BatchStatus::Completed {
        return Cascade::DeactivateStudents;
    }
    if old == BatchStatus::Completed && new == BatchStatus::Active {
        return Cascade::ReactivateStudents;
    }
    Cascade::None
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleError {
    pub code: String,
    pub message: String,
}

impl LifecycleError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub batch_id: String,
    pub old_status: String,
    pub new_status: String,
    pub current_module: i64,
    pub students_affected: usize,
}

fn db_err(e: rusqlite::Error) -> LifecycleError {
    LifecycleError::new("db_query_failed", e.to_string())
}

fn load_batch_state(
    conn: &Connection,
    batch_id: &str,
) -> Result<Option<(BatchStatus, i64)>, LifecycleError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT status, current_module FROM batches WHERE id = ?",
            [batch_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    match row {
        None => Ok(None),
        Some((status_raw, module)) => {
            let status = BatchStatus::parse(&status_raw).ok_or_else(|| {
                LifecycleError::new(
                    "db_query_failed",
                    format!("batch {} has unknown status '{}'", batch_id, status_raw),
                )
            })?;
            Ok(Some((status, module)))
        }
    }
}

fn apply_cascade(
    conn: &Connection,
    batch_id: &str,
    cascade: Cascade,
) -> Result<usize, LifecycleError> {
    let flag = match cascade {
        Cascade::None => return Ok(0),
        Cascade::DeactivateStudents => 0i64,
        Cascade::ReactivateStudents => 1i64,
    };
    conn.execute(
        "UPDATE students SET is_active = ?, updated_at = ? WHERE batch_id = ?",
        (flag, Utc::now().to_rfc3339(), batch_id),
    )
    .map_err(|e| LifecycleError::new("db_update_failed", e.to_string()))
}

/// Write the new status and run the student cascade in one transaction.
/// Completion also pins `current_module` to 3.
pub fn update_batch_status(
    conn: &Connection,
    batch_id: &str,
    new_status: BatchStatus,
) -> Result<StatusChange, LifecycleError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| LifecycleError::new("db_tx_failed", e.to_string()))?;

    let Some((old_status, old_module)) = load_batch_state(&tx, batch_id)? else {
        return Err(LifecycleError::new("not_found", "batch not found"));
    };

    let module = if new_status == BatchStatus::Completed {
        MODULE_MAX
    } else {
        old_module
    };
    tx.execute(
        "UPDATE batches SET status = ?, current_module = ?, updated_at = ? WHERE id = ?",
        (
            new_status.as_str(),
            module,
            Utc::now().to_rfc3339(),
            batch_id,
        ),
    )
    .map_err(|e| LifecycleError::new("db_update_failed", e.to_string()))?;

    let students_affected = apply_cascade(&tx, batch_id, cascade_for(old_status, new_status))?;

    tx.commit()
        .map_err(|e| LifecycleError::new("db_commit_failed", e.to_string()))?;

    Ok(StatusChange {
        batch_id: batch_id.to_string(),
        old_status: old_status.as_str().to_string(),
        new_status: new_status.as_str().to_string(),
        current_module: module,
        students_affected,
    })
}

/// Convenience form of `update_batch_status(.., Completed)`.
pub fn complete_batch(conn: &Connection, batch_id: &str) -> Result<StatusChange, LifecycleError> {
    update_batch_status(conn, batch_id, BatchStatus::Completed)
}

/// Set `current_module` directly. Rejects values outside [1,3] before any
/// write, and refuses to lower the module of an active batch.
pub fn update_batch_module(
    conn: &Connection,
    batch_id: &str,
    new_module: i64,
) -> Result<i64, LifecycleError> {
    if !(MODULE_MIN..=MODULE_MAX).contains(&new_module) {
        return Err(LifecycleError::new(
            "validation_failed",
            format!(
                "module must be between {} and {}, got {}",
                MODULE_MIN, MODULE_MAX, new_module
            ),
        ));
    }

    let Some((status, old_module)) = load_batch_state(conn, batch_id)? else {
        return Err(LifecycleError::new("not_found", "batch not found"));
    };
    if status == BatchStatus::Active && new_module < old_module {
        return Err(LifecycleError::new(
            "validation_failed",
            format!(
                "active batch module cannot decrease ({} -> {})",
                old_module, new_module
            ),
        ));
    }

    conn.execute(
        "UPDATE batches SET current_module = ?, updated_at = ? WHERE id = ?",
        (new_module, Utc::now().to_rfc3339(), batch_id),
    )
    .map_err(|e| LifecycleError::new("db_update_failed", e.to_string()))?;
    Ok(new_module)
}

/// The "Next Module" action: `current_module += 1` on an active batch.
pub fn advance_batch_module(conn: &Connection, batch_id: &str) -> Result<i64, LifecycleError> {
    let Some((status, module)) = load_batch_state(conn, batch_id)? else {
        return Err(LifecycleError::new("not_found", "batch not found"));
    };
    if status != BatchStatus::Active {
        return Err(LifecycleError::new(
            "validation_failed",
            format!("only active batches advance modules (batch is {})", status.as_str()),
        ));
    }
    if module >= MODULE_MAX {
        return Err(LifecycleError::new(
            "validation_failed",
            "batch is already at the final module",
        ));
    }
    update_batch_module(conn, batch_id, module + 1)
}
