use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{self, BatchStatus};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Batch codes look like `2025-Jan`: four digits, a dash, three letters.
fn valid_batch_code(code: &str) -> bool {
    let Some((year, month)) = code.split_once('-') else {
        return false;
    };
    year.len() == 4
        && year.chars().all(|c| c.is_ascii_digit())
        && month.len() == 3
        && month.chars().all(|c| c.is_ascii_alphabetic())
}

fn batch_exists(conn: &Connection, batch_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM batches WHERE id = ?", [batch_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn batch_row_json(conn: &Connection, batch_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT b.id, b.code, b.status, b.current_module,
                b.module_1, b.module_2, b.module_3,
                b.max_students, b.start_date, b.end_date,
                (SELECT COUNT(*) FROM students s WHERE s.batch_id = b.id)
         FROM batches b WHERE b.id = ?",
        [batch_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "currentModule": r.get::<_, i64>(3)?,
                "modules": [
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                ],
                "maxStudents": r.get::<_, Option<i64>>(7)?,
                "startDate": r.get::<_, Option<String>>(8)?,
                "endDate": r.get::<_, Option<String>>(9)?,
                "studentCount": r.get::<_, i64>(10)?,
            }))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("batch not found"))
}

/// Module names from params, missing entries as "". Updates treat "" as
/// "leave unchanged": a module name can be renamed but never cleared back to
/// empty.
fn module_names(params: &serde_json::Value) -> [String; 3] {
    let pick = |key: &str| {
        params
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string()
    };
    [pick("module1"), pick("module2"), pick("module3")]
}

fn batches_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?.trim().to_string();
    if !valid_batch_code(&code) {
        return Err(HandlerErr::new(
            "validation_failed",
            format!("batch code must look like 2025-Jan, got '{}'", code),
        ));
    }

    let status = match get_optional_str(params, "status") {
        None => BatchStatus::Upcoming,
        Some(raw) => BatchStatus::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params(format!("unknown batch status '{}'", raw))
        })?,
    };

    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM batches WHERE code = ?", [&code], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if taken.is_some() {
        return Err(HandlerErr::new(
            "duplicate_code",
            format!("batch code '{}' already exists", code),
        ));
    }

    let [m1, m2, m3] = module_names(params);
    let batch_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO batches(id, code, status, current_module,
                             module_1, module_2, module_3,
                             max_students, start_date, end_date, created_at)
         VALUES(?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?)",
        (
            &batch_id,
            &code,
            status.as_str(),
            &m1,
            &m2,
            &m3,
            params.get("maxStudents").and_then(|v| v.as_i64()),
            get_optional_str(params, "startDate"),
            get_optional_str(params, "endDate"),
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "batches" }))
    })?;

    batch_row_json(conn, &batch_id)
}

fn batches_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT b.id FROM batches b ORDER BY b.code DESC",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut batches = Vec::with_capacity(ids.len());
    for id in ids {
        batches.push(batch_row_json(conn, &id)?);
    }
    Ok(json!({ "batches": batches }))
}

fn batches_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    batch_row_json(conn, &batch_id)
}

fn batches_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }

    let [m1, m2, m3] = module_names(params);
    conn.execute(
        "UPDATE batches SET
            module_1 = COALESCE(NULLIF(?, ''), module_1),
            module_2 = COALESCE(NULLIF(?, ''), module_2),
            module_3 = COALESCE(NULLIF(?, ''), module_3),
            max_students = COALESCE(?, max_students),
            start_date = COALESCE(?, start_date),
            end_date = COALESCE(?, end_date),
            updated_at = ?
         WHERE id = ?",
        (
            &m1,
            &m2,
            &m3,
            params.get("maxStudents").and_then(|v| v.as_i64()),
            get_optional_str(params, "startDate"),
            get_optional_str(params, "endDate"),
            Utc::now().to_rfc3339(),
            &batch_id,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "batches" }))
    })?;

    batch_row_json(conn, &batch_id)
}

fn batches_update_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let raw = get_required_str(params, "status")?;
    let new_status = BatchStatus::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown batch status '{}'", raw)))?;

    let change = lifecycle::update_batch_status(conn, &batch_id, new_status)?;
    Ok(json!({
        "batchId": change.batch_id,
        "oldStatus": change.old_status,
        "newStatus": change.new_status,
        "currentModule": change.current_module,
        "studentsAffected": change.students_affected,
    }))
}

fn batches_complete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let change = lifecycle::complete_batch(conn, &batch_id)?;
    Ok(json!({
        "batchId": change.batch_id,
        "oldStatus": change.old_status,
        "newStatus": change.new_status,
        "currentModule": change.current_module,
        "studentsAffected": change.students_affected,
    }))
}

fn batches_update_module(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let module = params
        .get("module")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing module"))?;
    let current = lifecycle::update_batch_module(conn, &batch_id, module)?;
    Ok(json!({ "batchId": batch_id, "currentModule": current }))
}

fn batches_advance_module(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let current = lifecycle::advance_batch_module(conn, &batch_id)?;
    Ok(json!({ "batchId": batch_id, "currentModule": current }))
}

fn batches_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }

    let student_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE batch_id = ?",
            [&batch_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if student_count > 0 {
        return Err(HandlerErr::new(
            "batch_not_empty",
            format!("{} students still reference this batch", student_count),
        )
        .with_details(json!({ "studentCount": student_count })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM attendance WHERE batch_id = ?", [&batch_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "attendance" }))
        })?;
    tx.execute("DELETE FROM batches WHERE id = ?", [&batch_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "batches" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
               state: &AppState,
               req: &Request| {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        match f(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "batches.create" => Some(run(batches_create, state, req)),
        "batches.list" => Some(run(|conn, _| batches_list(conn), state, req)),
        "batches.get" => Some(run(batches_get, state, req)),
        "batches.update" => Some(run(batches_update, state, req)),
        "batches.updateStatus" => Some(run(batches_update_status, state, req)),
        "batches.complete" => Some(run(batches_complete, state, req)),
        "batches.updateModule" => Some(run(batches_update_module, state, req)),
        "batches.advanceModule" => Some(run(batches_advance_module, state, req)),
        "batches.delete" => Some(run(batches_delete, state, req)),
        _ => None,
    }
}
