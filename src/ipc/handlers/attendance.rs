use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate, Weekday};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const STUDENT_DAYS_KEY: &str = "attendance.studentDays";
pub const TEACHER_DAYS_KEY: &str = "attendance.teacherDays";

pub const DEFAULT_STUDENT_DAYS: [Weekday; 3] = [Weekday::Sun, Weekday::Tue, Weekday::Thu];
pub const DEFAULT_TEACHER_DAYS: [Weekday; 3] = [Weekday::Sat, Weekday::Mon, Weekday::Thu];

const STATUSES: [&str; 3] = ["present", "absent", "late"];

fn parse_status(raw: &str) -> Result<String, HandlerErr> {
    if STATUSES.contains(&raw) {
        Ok(raw.to_string())
    } else {
        Err(HandlerErr::bad_params(format!(
            "status must be present|absent|late, got '{}'",
            raw
        )))
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("date must be YYYY-MM-DD, got '{}'", raw)))
}

/// Class-day schedule from settings, falling back to the built-in defaults.
fn schedule_days(
    conn: &Connection,
    key: &str,
    defaults: &[Weekday; 3],
) -> Result<Vec<Weekday>, HandlerErr> {
    let stored = db::settings_get_json(conn, key)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some(value) = stored else {
        return Ok(defaults.to_vec());
    };
    let Some(items) = value.as_array() else {
        return Ok(defaults.to_vec());
    };
    let mut days = Vec::with_capacity(items.len());
    for item in items {
        let Some(name) = item.as_str() else { continue };
        if let Ok(day) = name.parse::<Weekday>() {
            days.push(day);
        }
    }
    if days.is_empty() {
        return Ok(defaults.to_vec());
    }
    Ok(days)
}

fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

fn check_schedule(date: NaiveDate, days: &[Weekday]) -> Result<Weekday, HandlerErr> {
    let weekday = date.weekday();
    if days.contains(&weekday) {
        return Ok(weekday);
    }
    let allowed: Vec<&str> = days.iter().map(|d| weekday_label(*d)).collect();
    Err(HandlerErr::new(
        "schedule_error",
        format!(
            "{} falls on a {}, class days are {}",
            date,
            weekday_label(weekday),
            allowed.join("/")
        ),
    ))
}

fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let batch_id = get_required_str(params, "batchId")?;
    let date_raw = get_required_str(params, "date")?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    let date = parse_date(&date_raw)?;

    let days = schedule_days(conn, STUDENT_DAYS_KEY, &DEFAULT_STUDENT_DAYS)?;
    let weekday = check_schedule(date, &days)?;

    let belongs: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND batch_id = ?",
            (&student_id, &batch_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if belongs.is_none() {
        return Err(HandlerErr::not_found("student not found in batch"));
    }

    conn.execute(
        "INSERT INTO attendance(id, student_id, batch_id, date, day_of_week, status, notes)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date, batch_id) DO UPDATE SET
           status = excluded.status,
           day_of_week = excluded.day_of_week,
           notes = excluded.notes",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &batch_id,
            date.to_string(),
            weekday_label(weekday),
            &status,
            get_optional_str(params, "notes"),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "attendance" }))
    })?;

    Ok(json!({
        "studentId": student_id,
        "batchId": batch_id,
        "date": date.to_string(),
        "dayOfWeek": weekday_label(weekday),
        "status": status,
    }))
}

fn attendance_list_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, batch_id, date, day_of_week, status, notes
             FROM attendance
             WHERE student_id = ?
             ORDER BY date",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "batchId": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "dayOfWeek": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "notes": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let present_or_late = rows
        .iter()
        .filter(|r| {
            matches!(
                r.get("status").and_then(|v| v.as_str()),
                Some("present") | Some("late")
            )
        })
        .count() as i64;
    let percentage =
        crate::ranking::attendance_percentage(present_or_late, rows.len() as i64);

    Ok(json!({
        "studentId": student_id,
        "records": rows,
        "attendancePercentage": percentage,
    }))
}

fn attendance_delete_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attendance_id = get_required_str(params, "attendanceId")?;
    let deleted = conn
        .execute("DELETE FROM attendance WHERE id = ?", [&attendance_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "attendance" }))
        })?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("attendance record not found"));
    }
    Ok(json!({ "ok": true }))
}

fn teacher_attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let date_raw = get_required_str(params, "date")?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    let date = parse_date(&date_raw)?;

    let days = schedule_days(conn, TEACHER_DAYS_KEY, &DEFAULT_TEACHER_DAYS)?;
    let weekday = check_schedule(date, &days)?;

    let known: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if known.is_none() {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    conn.execute(
        "INSERT INTO teacher_attendance(id, teacher_id, date, day_of_week, status, notes)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(teacher_id, date) DO UPDATE SET
           status = excluded.status,
           day_of_week = excluded.day_of_week,
           notes = excluded.notes",
        (
            Uuid::new_v4().to_string(),
            &teacher_id,
            date.to_string(),
            weekday_label(weekday),
            &status,
            get_optional_str(params, "notes"),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_update_failed", e)
            .with_details(json!({ "table": "teacher_attendance" }))
    })?;

    Ok(json!({
        "teacherId": teacher_id,
        "date": date.to_string(),
        "dayOfWeek": weekday_label(weekday),
        "status": status,
    }))
}

fn teacher_attendance_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, date, day_of_week, status, notes
             FROM teacher_attendance
             WHERE teacher_id = ?
             ORDER BY date",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "dayOfWeek": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "notes": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "teacherId": teacher_id, "records": rows }))
}

fn teacher_attendance_delete_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attendance_id = get_required_str(params, "attendanceId")?;
    let deleted = conn
        .execute(
            "DELETE FROM teacher_attendance WHERE id = ?",
            [&attendance_id],
        )
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e)
                .with_details(json!({ "table": "teacher_attendance" }))
        })?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("attendance record not found"));
    }
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
        "attendance.record" => Some(run(attendance_record, state, req)),
        "attendance.listForStudent" => Some(run(attendance_list_for_student, state, req)),
        "attendance.deleteRecord" => Some(run(attendance_delete_record, state, req)),
        "teacherAttendance.record" => Some(run(teacher_attendance_record, state, req)),
        "teacherAttendance.listForTeacher" => Some(run(teacher_attendance_list, state, req)),
        "teacherAttendance.deleteRecord" => {
            Some(run(teacher_attendance_delete_record, state, req))
        }
        _ => None,
    }
}
