use crate::db;
use crate::invite;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::attendance::{
    DEFAULT_STUDENT_DAYS, DEFAULT_TEACHER_DAYS, STUDENT_DAYS_KEY, TEACHER_DAYS_KEY,
};
use crate::ipc::handlers::invitations::BASE_URL_KEY;
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Weekday;
use rusqlite::Connection;
use serde_json::json;

#[derive(Clone, Copy)]
enum SetupSection {
    Attendance,
    Invites,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "invites" => Some(Self::Invites),
            _ => None,
        }
    }
}

fn short_day(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

fn stored_days(
    conn: &Connection,
    key: &str,
    defaults: &[Weekday; 3],
) -> Result<serde_json::Value, HandlerErr> {
    let stored = db::settings_get_json(conn, key)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(stored.unwrap_or_else(|| {
        json!(defaults.iter().map(|d| short_day(*d)).collect::<Vec<_>>())
    }))
}

fn validate_days(raw: &serde_json::Value, field: &str) -> Result<(), HandlerErr> {
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::bad_params(format!(
            "{} must be an array of weekday names",
            field
        )));
    };
    if items.is_empty() {
        return Err(HandlerErr::bad_params(format!(
            "{} must name at least one weekday",
            field
        )));
    }
    for item in items {
        let Some(name) = item.as_str() else {
            return Err(HandlerErr::bad_params(format!(
                "{} entries must be strings",
                field
            )));
        };
        if name.parse::<Weekday>().is_err() {
            return Err(HandlerErr::bad_params(format!(
                "'{}' is not a weekday name",
                name
            )));
        }
    }
    Ok(())
}

fn setup_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let section_raw = get_required_str(params, "section")?;
    let section = SetupSection::parse(&section_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown section '{}'", section_raw)))?;

    match section {
        SetupSection::Attendance => Ok(json!({
            "studentDays": stored_days(conn, STUDENT_DAYS_KEY, &DEFAULT_STUDENT_DAYS)?,
            "teacherDays": stored_days(conn, TEACHER_DAYS_KEY, &DEFAULT_TEACHER_DAYS)?,
        })),
        SetupSection::Invites => {
            let base = db::settings_get_json(conn, BASE_URL_KEY)
                .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| invite::DEFAULT_BASE_URL.to_string());
            Ok(json!({ "baseUrl": base }))
        }
    }
}

fn setup_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let section_raw = get_required_str(params, "section")?;
    let section = SetupSection::parse(&section_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown section '{}'", section_raw)))?;
    let values = params
        .get("values")
        .ok_or_else(|| HandlerErr::bad_params("missing values"))?;

    match section {
        SetupSection::Attendance => {
            if let Some(days) = values.get("studentDays") {
                validate_days(days, "studentDays")?;
                db::settings_set_json(conn, STUDENT_DAYS_KEY, days)
                    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            }
            if let Some(days) = values.get("teacherDays") {
                validate_days(days, "teacherDays")?;
                db::settings_set_json(conn, TEACHER_DAYS_KEY, days)
                    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            }
        }
        SetupSection::Invites => {
            if let Some(base) = values.get("baseUrl") {
                if base.as_str().map(|s| s.trim().is_empty()).unwrap_or(true) {
                    return Err(HandlerErr::bad_params("baseUrl must be a non-empty string"));
                }
                db::settings_set_json(conn, BASE_URL_KEY, base)
                    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            }
        }
    }

    setup_get(conn, params)
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
        "setup.get" => Some(run(setup_get, state, req)),
        "setup.update" => Some(run(setup_update, state, req)),
        _ => None,
    }
}
