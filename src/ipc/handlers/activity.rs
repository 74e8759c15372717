use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::with_conn;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

fn activity_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let limit = match params.get("limit") {
        None => DEFAULT_LIMIT,
        Some(v) if v.is_null() => DEFAULT_LIMIT,
        Some(v) => v
            .as_i64()
            .ok_or_else(|| HandlerErr::bad_params("limit must be an integer"))?
            .clamp(1, MAX_LIMIT),
    };
    let entries = db::activity_log_list(conn, limit).map_err(HandlerErr::query)?;
    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "activity.list" => Some(with_conn(state, req, activity_list)),
        _ => None,
    }
}
