use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const TASK_STATUSES: [&str; 3] = ["NOT_STARTED", "IN_PROGRESS", "COMPLETED"];

fn parse_task_status(raw: &str) -> Result<String, HandlerErr> {
    if TASK_STATUSES.contains(&raw) {
        Ok(raw.to_string())
    } else {
        Err(HandlerErr::bad_params(format!(
            "status must be NOT_STARTED|IN_PROGRESS|COMPLETED, got '{}'",
            raw
        )))
    }
}

fn actor_role(conn: &Connection, actor_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT role FROM profiles WHERE id = ?",
        [actor_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::new("unknown_profile", "acting profile not found"))
}

fn task_row_json(conn: &Connection, task_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, title, description, status, assigned_to, created_by,
                deadline, completed_at, created_at
         FROM tasks WHERE id = ?",
        [task_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "status": r.get::<_, String>(3)?,
                "assignedTo": r.get::<_, Option<String>>(4)?,
                "createdBy": r.get::<_, String>(5)?,
                "deadline": r.get::<_, Option<String>>(6)?,
                "completedAt": r.get::<_, Option<String>>(7)?,
                "createdAt": r.get::<_, String>(8)?,
            }))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("task not found"))
}

/// Edit/delete gate: super admins, or the task's assignee.
fn require_task_access(
    conn: &Connection,
    task_id: &str,
    actor_id: &str,
) -> Result<(), HandlerErr> {
    let role = actor_role(conn, actor_id)?;
    if role == "super_admin" {
        return Ok(());
    }
    let assigned_to: Option<String> = conn
        .query_row(
            "SELECT assigned_to FROM tasks WHERE id = ?",
            [task_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("task not found"))?;
    if assigned_to.as_deref() == Some(actor_id) {
        return Ok(());
    }
    Err(HandlerErr::new(
        "forbidden",
        "only a super admin or the assignee may modify this task",
    ))
}

fn resolve_assignee(
    conn: &Connection,
    actor_id: &str,
    actor_role_name: &str,
    params: &serde_json::Value,
) -> Result<Option<String>, HandlerErr> {
    let Some(assigned_to) = get_optional_str(params, "assignedTo") else {
        return Ok(None);
    };
    if actor_role_name != "super_admin" && assigned_to != actor_id {
        return Err(HandlerErr::new(
            "forbidden",
            "only a super admin may assign tasks to others",
        ));
    }
    let known: Option<i64> = conn
        .query_row("SELECT 1 FROM profiles WHERE id = ?", [&assigned_to], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if known.is_none() {
        return Err(HandlerErr::not_found("assignee profile not found"));
    }
    Ok(Some(assigned_to))
}

fn tasks_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let role = actor_role(conn, &actor_id)?;
    if role == "viewer" {
        return Err(HandlerErr::new("forbidden", "viewers cannot create tasks"));
    }

    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let assigned_to = resolve_assignee(conn, &actor_id, &role, params)?;

    let task_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO tasks(id, title, description, status, assigned_to, created_by,
                           deadline, created_at)
         VALUES(?, ?, ?, 'NOT_STARTED', ?, ?, ?, ?)",
        (
            &task_id,
            &title,
            get_optional_str(params, "description"),
            &assigned_to,
            &actor_id,
            get_optional_str(params, "deadline"),
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "tasks" })))?;

    task_row_json(conn, &task_id)
}

fn tasks_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let task_id = get_required_str(params, "taskId")?;
    require_task_access(conn, &task_id, &actor_id)?;

    let role = actor_role(conn, &actor_id)?;
    let assigned_to = resolve_assignee(conn, &actor_id, &role, params)?;

    conn.execute(
        "UPDATE tasks SET
            title = COALESCE(?, title),
            description = COALESCE(?, description),
            assigned_to = COALESCE(?, assigned_to),
            deadline = COALESCE(?, deadline),
            updated_at = ?
         WHERE id = ?",
        (
            get_optional_str(params, "title"),
            get_optional_str(params, "description"),
            &assigned_to,
            get_optional_str(params, "deadline"),
            Utc::now().to_rfc3339(),
            &task_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "tasks" })))?;

    task_row_json(conn, &task_id)
}

fn tasks_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let task_id = get_required_str(params, "taskId")?;
    let status = parse_task_status(&get_required_str(params, "status")?)?;
    require_task_access(conn, &task_id, &actor_id)?;

    let completed_at = if status == "COMPLETED" {
        Some(Utc::now().to_rfc3339())
    } else {
        None
    };
    conn.execute(
        "UPDATE tasks SET status = ?, completed_at = ?, updated_at = ? WHERE id = ?",
        (&status, &completed_at, Utc::now().to_rfc3339(), &task_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "tasks" })))?;

    task_row_json(conn, &task_id)
}

fn tasks_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM tasks ORDER BY created_at DESC")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        tasks.push(task_row_json(conn, &id)?);
    }
    Ok(json!({ "tasks": tasks }))
}

fn tasks_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let task_id = get_required_str(params, "taskId")?;
    require_task_access(conn, &task_id, &actor_id)?;

    conn.execute("DELETE FROM tasks WHERE id = ?", [&task_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "tasks" }))
        })?;
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
        "tasks.create" => Some(run(tasks_create, state, req)),
        "tasks.update" => Some(run(tasks_update, state, req)),
        "tasks.setStatus" => Some(run(tasks_set_status, state, req)),
        "tasks.list" => Some(run(|conn, _| tasks_list(conn), state, req)),
        "tasks.delete" => Some(run(tasks_delete, state, req)),
        _ => None,
    }
}
