use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, get_optional_str, get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn map_write_err(e: rusqlite::Error, code: &'static str) -> HandlerErr {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return HandlerErr::new("conflict", "nip already belongs to another teacher")
                .with_details(json!({ "table": "teachers" }));
        }
    }
    HandlerErr::new(code, e.to_string()).with_details(json!({ "table": "teachers" }))
}

fn teachers_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, nip, name, active FROM teachers ORDER BY name")
        .map_err(HandlerErr::query)?;
    let teachers = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "nip": r.get::<_, Option<String>>(1)?,
                "name": r.get::<_, String>(2)?,
                "active": r.get::<_, i64>(3)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let nip = get_optional_str(params, "nip");
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, nip, name, active, updated_at) VALUES(?, ?, ?, 1, ?)",
        (&id, &nip, &name, db::now_rfc3339()),
    )
    .map_err(|e| map_write_err(e, "db_insert_failed"))?;
    helpers::log_activity(conn, params, "teachers.create", json!({ "teacherId": id, "name": name }));
    Ok(json!({ "teacherId": id }))
}

fn teachers_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    if !helpers::teacher_exists(conn, &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    let name = get_optional_str(params, "name");
    // Outer None keeps the stored nip; Some(None) clears it.
    let nip: Option<Option<String>> = match params.get("nip") {
        None => None,
        Some(serde_json::Value::Null) => Some(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Some(None),
        Some(serde_json::Value::String(s)) => Some(Some(s.trim().to_string())),
        Some(_) => return Err(HandlerErr::bad_params("nip must be string or null")),
    };
    let active = params.get("active").and_then(|v| v.as_bool());
    if name.is_none() && nip.is_none() && active.is_none() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    conn.execute(
        "UPDATE teachers SET
           name = COALESCE(?1, name),
           nip = CASE WHEN ?2 THEN ?3 ELSE nip END,
           active = COALESCE(?4, active),
           updated_at = ?5
         WHERE id = ?6",
        (
            &name,
            nip.is_some(),
            nip.flatten(),
            active.map(|b| b as i64),
            db::now_rfc3339(),
            &teacher_id,
        ),
    )
    .map_err(|e| map_write_err(e, "db_update_failed"))?;
    helpers::log_activity(conn, params, "teachers.update", json!({ "teacherId": teacher_id }));
    Ok(json!({ "ok": true }))
}

fn teachers_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    if !helpers::teacher_exists(conn, &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    let owned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM grades WHERE teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    if owned > 0 {
        return Err(HandlerErr::new("conflict", "teacher still owns grade records")
            .with_details(json!({ "gradeCount": owned })));
    }
    conn.execute("DELETE FROM teacher_attendance WHERE teacher_id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    helpers::log_activity(conn, params, "teachers.delete", json!({ "teacherId": teacher_id }));
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(with_conn(state, req, teachers_list)),
        "teachers.create" => Some(with_conn(state, req, teachers_create)),
        "teachers.update" => Some(with_conn(state, req, teachers_update)),
        "teachers.delete" => Some(with_conn(state, req, teachers_delete)),
        _ => None,
    }
}
