use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const METRIC_COLUMNS: [&str; 7] = [
    "creativity",
    "leadership",
    "behavior",
    "presentation",
    "communication",
    "technical_skills",
    "general_performance",
];

fn metric_param_key(column: &str) -> String {
    // creativity -> creativity, technical_skills -> technicalSkills
    let mut out = String::with_capacity(column.len());
    let mut upper_next = false;
    for c in column.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// `STU-<year>-<4 digits>`, sequential within the year.
fn next_student_no(conn: &Connection, year: i32) -> Result<String, HandlerErr> {
    let prefix = format!("STU-{}-", year);
    let max_no: Option<String> = conn
        .query_row(
            "SELECT MAX(student_no) FROM students WHERE student_no LIKE ?",
            [format!("{}%", prefix)],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let next_seq = max_no
        .and_then(|no| no.rsplit('-').next().and_then(|s| s.parse::<u32>().ok()))
        .map(|n| n + 1)
        .unwrap_or(1);
    Ok(format!("{}{:04}", prefix, next_seq))
}

fn student_row_json(conn: &Connection, student_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT s.id, s.student_no, s.first_name, s.last_name, s.contact, s.gender,
                s.batch_id, b.code, s.is_active,
                s.creativity, s.leadership, s.behavior, s.presentation,
                s.communication, s.technical_skills, s.general_performance,
                s.profile_picture
         FROM students s
         JOIN batches b ON b.id = s.batch_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentNo": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "lastName": r.get::<_, String>(3)?,
                "contact": r.get::<_, Option<String>>(4)?,
                "gender": r.get::<_, Option<String>>(5)?,
                "batchId": r.get::<_, String>(6)?,
                "batchCode": r.get::<_, String>(7)?,
                "isActive": r.get::<_, i64>(8)? != 0,
                "scores": {
                    "creativity": r.get::<_, f64>(9)?,
                    "leadership": r.get::<_, f64>(10)?,
                    "behavior": r.get::<_, f64>(11)?,
                    "presentation": r.get::<_, f64>(12)?,
                    "communication": r.get::<_, f64>(13)?,
                    "technicalSkills": r.get::<_, f64>(14)?,
                    "generalPerformance": r.get::<_, f64>(15)?,
                },
                "profilePicture": r.get::<_, Option<String>>(16)?,
            }))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("student not found"))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }

    let batch_known: Option<i64> = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?", [&batch_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if batch_known.is_none() {
        return Err(HandlerErr::not_found("batch not found"));
    }

    let now = Utc::now();
    let student_no = next_student_no(conn, now.year())?;
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, student_no, first_name, last_name, contact, gender,
                              batch_id, is_active, profile_picture, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &student_id,
            &student_no,
            &first_name,
            &last_name,
            get_optional_str(params, "contact"),
            get_optional_str(params, "gender"),
            &batch_id,
            get_optional_str(params, "profilePicture"),
            now.to_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" }))
    })?;

    student_row_json(conn, &student_id)
}

/// Validate every requested metric before anything is written. A payload with
/// one bad score changes nothing.
fn collect_metric_updates(
    scores: &serde_json::Value,
) -> Result<Vec<(&'static str, f64)>, HandlerErr> {
    let mut updates = Vec::new();
    for column in METRIC_COLUMNS {
        let key = metric_param_key(column);
        let Some(raw) = scores.get(&key) else {
            continue;
        };
        let value = raw.as_f64().ok_or_else(|| {
            HandlerErr::bad_params(format!("score {} must be a number", key))
        })?;
        if !(0.0..=10.0).contains(&value) {
            return Err(HandlerErr::new(
                "validation_failed",
                format!("score {} must be in [0,10], got {}", key, value),
            ));
        }
        updates.push((column, value));
    }
    Ok(updates)
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    // Existence check up front so metric validation errors beat not_found noise.
    student_row_json(conn, &student_id)?;

    let metric_updates = match params.get("scores") {
        Some(scores) => collect_metric_updates(scores)?,
        None => Vec::new(),
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for (column, value) in &metric_updates {
        // Column names come from the fixed list above, never from input.
        let sql = format!("UPDATE students SET {} = ? WHERE id = ?", column);
        tx.execute(&sql, (*value, &student_id)).map_err(|e| {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "students" }))
        })?;
    }
    tx.execute(
        "UPDATE students SET
            first_name = COALESCE(?, first_name),
            last_name = COALESCE(?, last_name),
            contact = COALESCE(?, contact),
            gender = COALESCE(?, gender),
            profile_picture = COALESCE(?, profile_picture),
            updated_at = ?
         WHERE id = ?",
        (
            get_optional_str(params, "firstName"),
            get_optional_str(params, "lastName"),
            get_optional_str(params, "contact"),
            get_optional_str(params, "gender"),
            get_optional_str(params, "profilePicture"),
            Utc::now().to_rfc3339(),
            &student_id,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "students" }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    student_row_json(conn, &student_id)
}

fn students_set_active(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let is_active = params
        .get("isActive")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("missing isActive"))?;

    let changed = conn
        .execute(
            "UPDATE students SET is_active = ?, updated_at = ? WHERE id = ?",
            (is_active as i64, Utc::now().to_rfc3339(), &student_id),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "students" }))
        })?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    Ok(json!({ "studentId": student_id, "isActive": is_active }))
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (sql, bind): (String, Option<String>) = match get_optional_str(params, "batchId") {
        Some(batch_id) => (
            "SELECT s.id FROM students s WHERE s.batch_id = ? ORDER BY s.student_no".to_string(),
            Some(batch_id),
        ),
        None => (
            "SELECT s.id FROM students s ORDER BY s.student_no".to_string(),
            None,
        ),
    };

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let ids = match bind {
        Some(batch_id) => stmt
            .query_map([batch_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut students = Vec::with_capacity(ids.len());
    for id in ids {
        students.push(student_row_json(conn, &id)?);
    }
    Ok(json!({ "students": students }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let known: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if known.is_none() {
        return Err(HandlerErr::not_found("student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM attendance WHERE student_id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "attendance" }))
        })?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "students" }))
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
        "students.create" => Some(run(students_create, state, req)),
        "students.update" => Some(run(students_update, state, req)),
        "students.setActive" => Some(run(students_set_active, state, req)),
        "students.list" => Some(run(students_list, state, req)),
        "students.delete" => Some(run(students_delete, state, req)),
        _ => None,
    }
}
