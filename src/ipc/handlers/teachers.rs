use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn next_teacher_no(conn: &Connection, year: i32) -> Result<String, HandlerErr> {
    let prefix = format!("TCH-{}-", year);
    let max_no: Option<String> = conn
        .query_row(
            "SELECT MAX(teacher_no) FROM teachers WHERE teacher_no LIKE ?",
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

fn teacher_row_json(conn: &Connection, teacher_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, teacher_no, first_name, last_name, contact, gender,
                is_active, profile_picture
         FROM teachers WHERE id = ?",
        [teacher_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherNo": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "lastName": r.get::<_, String>(3)?,
                "contact": r.get::<_, Option<String>>(4)?,
                "gender": r.get::<_, Option<String>>(5)?,
                "isActive": r.get::<_, i64>(6)? != 0,
                "profilePicture": r.get::<_, Option<String>>(7)?,
            }))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("teacher not found"))
}

fn teachers_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }

    let now = Utc::now();
    let teacher_no = next_teacher_no(conn, now.year())?;
    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, teacher_no, first_name, last_name, contact, gender,
                              is_active, profile_picture, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &teacher_id,
            &teacher_no,
            &first_name,
            &last_name,
            get_optional_str(params, "contact"),
            get_optional_str(params, "gender"),
            get_optional_str(params, "profilePicture"),
            now.to_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "teachers" }))
    })?;

    teacher_row_json(conn, &teacher_id)
}

fn teachers_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    teacher_row_json(conn, &teacher_id)?;

    let is_active = params.get("isActive").and_then(|v| v.as_bool());
    conn.execute(
        "UPDATE teachers SET
            first_name = COALESCE(?, first_name),
            last_name = COALESCE(?, last_name),
            contact = COALESCE(?, contact),
            gender = COALESCE(?, gender),
            profile_picture = COALESCE(?, profile_picture),
            is_active = COALESCE(?, is_active),
            updated_at = ?
         WHERE id = ?",
        (
            get_optional_str(params, "firstName"),
            get_optional_str(params, "lastName"),
            get_optional_str(params, "contact"),
            get_optional_str(params, "gender"),
            get_optional_str(params, "profilePicture"),
            is_active.map(|b| b as i64),
            Utc::now().to_rfc3339(),
            &teacher_id,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "teachers" }))
    })?;

    teacher_row_json(conn, &teacher_id)
}

fn teachers_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM teachers ORDER BY teacher_no")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut teachers = Vec::with_capacity(ids.len());
    for id in ids {
        teachers.push(teacher_row_json(conn, &id)?);
    }
    Ok(json!({ "teachers": teachers }))
}

fn teachers_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    teacher_row_json(conn, &teacher_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "DELETE FROM teacher_attendance WHERE teacher_id = ?",
        [&teacher_id],
    )
    .map_err(|e| {
        HandlerErr::db("db_delete_failed", e)
            .with_details(json!({ "table": "teacher_attendance" }))
    })?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "teachers" }))
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
        "teachers.create" => Some(run(teachers_create, state, req)),
        "teachers.update" => Some(run(teachers_update, state, req)),
        "teachers.list" => Some(run(|conn, _| teachers_list(conn), state, req)),
        "teachers.delete" => Some(run(teachers_delete, state, req)),
        _ => None,
    }
}
