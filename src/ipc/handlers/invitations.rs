use crate::db;
use crate::invite::{self, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const BASE_URL_KEY: &str = "invites.baseUrl";

fn base_url(conn: &Connection) -> String {
    db::settings_get_json(conn, BASE_URL_KEY)
        .ok()
        .flatten()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| invite::DEFAULT_BASE_URL.to_string())
}

fn invitation_row_json(
    conn: &Connection,
    invitation_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, token, email, role, invited_by, inviter_name,
                created_at, expires_at, used, used_at, used_by
         FROM invitations WHERE id = ?",
        [invitation_id],
        |r| {
            let used = r.get::<_, i64>(8)? != 0;
            let expires_at: String = r.get(7)?;
            let state = DateTime::parse_from_rfc3339(&expires_at)
                .map(|exp| invite::invitation_state(used, exp.with_timezone(&Utc), Utc::now()))
                .unwrap_or("pending");
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "token": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "invitedBy": r.get::<_, Option<String>>(4)?,
                "inviterName": r.get::<_, Option<String>>(5)?,
                "createdAt": r.get::<_, String>(6)?,
                "expiresAt": expires_at,
                "used": used,
                "usedAt": r.get::<_, Option<String>>(9)?,
                "usedBy": r.get::<_, Option<String>>(10)?,
                "state": state,
            }))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("invitation not found"))
}

fn invitations_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?.trim().to_lowercase();
    if !email.contains('@') {
        return Err(HandlerErr::new(
            "validation_failed",
            format!("'{}' is not an email address", email),
        ));
    }
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("role must be admin|viewer, got '{}'", role_raw)))?;

    let invited_by = get_optional_str(params, "invitedBy");
    let inviter_name = get_optional_str(params, "inviterName");

    let now = Utc::now();
    let token = invite::generate_token();
    let invitation_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO invitations(id, token, email, role, invited_by, inviter_name,
                                 created_at, expires_at, used)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 0)",
        (
            &invitation_id,
            &token,
            &email,
            role.as_str(),
            &invited_by,
            &inviter_name,
            now.to_rfc3339(),
            invite::expiry_from(now).to_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "invitations" }))
    })?;

    let link = invite::signup_link(&base_url(conn), &token);

    // Best-effort notification; the invitation stands even if it never sends.
    eprintln!(
        "invite: queued mail to {} ({} invite from {})",
        email,
        role.as_str(),
        inviter_name.as_deref().unwrap_or("admin")
    );

    let invitation = invitation_row_json(conn, &invitation_id)?;
    Ok(json!({ "invitation": invitation, "signupLink": link }))
}

fn invitations_validate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let token = get_required_str(params, "token")?;
    // Expired, used, and unknown all collapse into one answer: signup denied.
    let invitation_id: Option<String> = conn
        .query_row(
            "SELECT id FROM invitations WHERE token = ? AND used = 0 AND expires_at > ?",
            (&token, Utc::now().to_rfc3339()),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match invitation_id {
        Some(id) => {
            let invitation = invitation_row_json(conn, &id)?;
            Ok(json!({ "valid": true, "invitation": invitation }))
        }
        None => Err(HandlerErr::new(
            "invalid_token",
            "invitation is unknown, used, or expired",
        )),
    }
}

fn invitations_mark_used(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let invitation_id = get_required_str(params, "invitationId")?;
    let user_id = get_required_str(params, "userId")?;

    // Single conditional write; the affected-row count decides the race.
    let changed = conn
        .execute(
            "UPDATE invitations SET used = 1, used_at = ?, used_by = ?
             WHERE id = ? AND used = 0",
            (Utc::now().to_rfc3339(), &user_id, &invitation_id),
        )
        .map_err(|e| {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "invitations" }))
        })?;
    if changed == 0 {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM invitations WHERE id = ?",
                [&invitation_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        return Err(match exists {
            Some(_) => HandlerErr::new("already_used", "invitation was already redeemed"),
            None => HandlerErr::not_found("invitation not found"),
        });
    }

    invitation_row_json(conn, &invitation_id).map(|inv| json!({ "invitation": inv }))
}

fn invitations_revoke(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let invitation_id = get_required_str(params, "invitationId")?;
    let deleted = conn
        .execute("DELETE FROM invitations WHERE id = ?", [&invitation_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "invitations" }))
        })?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("invitation not found"));
    }
    Ok(json!({ "ok": true }))
}

fn invitations_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM invitations ORDER BY created_at DESC")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut invitations = Vec::with_capacity(ids.len());
    for id in ids {
        invitations.push(invitation_row_json(conn, &id)?);
    }
    Ok(json!({ "invitations": invitations }))
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
        "invitations.create" => Some(run(invitations_create, state, req)),
        "invitations.validate" => Some(run(invitations_validate, state, req)),
        "invitations.markUsed" => Some(run(invitations_mark_used, state, req)),
        "invitations.revoke" => Some(run(invitations_revoke, state, req)),
        "invitations.list" => Some(run(|conn, _| invitations_list(conn), state, req)),
        _ => None,
    }
}
