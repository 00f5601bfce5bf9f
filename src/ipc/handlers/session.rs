use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn profile_row_json(conn: &Connection, profile_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, email, display_name, role, created_at FROM profiles WHERE id = ?",
        [profile_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "displayName": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::new("unknown_profile", "profile not found"))
}

/// Signup. The very first profile bootstraps as super_admin; everyone after
/// that joins through an invitation and inherits its role. Redemption is a
/// conditional update so the token stays single-use under concurrent signups.
fn profiles_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?.trim().to_lowercase();
    let display_name = get_required_str(params, "displayName")?.trim().to_string();
    if email.is_empty() || display_name.is_empty() {
        return Err(HandlerErr::bad_params("email and displayName are required"));
    }

    let profile_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM profiles", [], |r| r.get(0))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let profile_id = Uuid::new_v4().to_string();
    let role = if profile_count == 0 {
        "super_admin".to_string()
    } else {
        let token = get_optional_str(params, "invitationToken")
            .ok_or_else(|| HandlerErr::new("invalid_token", "signup requires an invitation"))?;
        let invitation: Option<(String, String)> = tx
            .query_row(
                "SELECT id, role FROM invitations
                 WHERE token = ? AND used = 0 AND expires_at > ?",
                (&token, Utc::now().to_rfc3339()),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let Some((invitation_id, role)) = invitation else {
            return Err(HandlerErr::new(
                "invalid_token",
                "invitation is unknown, used, or expired",
            ));
        };
        let changed = tx
            .execute(
                "UPDATE invitations SET used = 1, used_at = ?, used_by = ?
                 WHERE id = ? AND used = 0",
                (Utc::now().to_rfc3339(), &profile_id, &invitation_id),
            )
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        if changed == 0 {
            return Err(HandlerErr::new(
                "already_used",
                "invitation was already redeemed",
            ));
        }
        role
    };

    tx.execute(
        "INSERT INTO profiles(id, email, display_name, role, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &profile_id,
            &email,
            &display_name,
            &role,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "profiles" }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    profile_row_json(conn, &profile_id)
}

fn profiles_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM profiles ORDER BY created_at")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut profiles = Vec::with_capacity(ids.len());
    for id in ids {
        profiles.push(profile_row_json(conn, &id)?);
    }
    Ok(json!({ "profiles": profiles }))
}

/// An unknown profile is an error, never a default identity. Privilege comes
/// only from a row in `profiles`.
fn session_identify(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let profile_id = get_required_str(params, "profileId")?;
    let profile = profile_row_json(conn, &profile_id)?;
    Ok(json!({ "authenticated": true, "profile": profile }))
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
        "profiles.create" => Some(run(profiles_create, state, req)),
        "profiles.list" => Some(run(|conn, _| profiles_list(conn), state, req)),
        "session.identify" => Some(run(session_identify, state, req)),
        _ => None,
    }
}
