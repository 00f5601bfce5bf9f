use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::ranking;
use serde_json::json;

fn handle_rankings_filtered(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match ranking::rankings_filtered(conn, req.params.get("filters")) {
        Ok(rows) => match serde_json::to_value(&rows) {
            Ok(value) => ok(&req.id, json!({ "rankings": value })),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn handle_rankings_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match ranking::rankings_stats(conn, req.params.get("filters")) {
        Ok(stats) => match serde_json::to_value(&stats) {
            Ok(value) => ok(&req.id, value),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rankings.filtered" => Some(handle_rankings_filtered(state, req)),
        "rankings.stats" => Some(handle_rankings_stats(state, req)),
        _ => None,
    }
}
