use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, get_optional_str, get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn map_write_err(e: rusqlite::Error, code: &'static str) -> HandlerErr {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return HandlerErr::new("conflict", "nis already belongs to another student")
                .with_details(json!({ "table": "students" }));
        }
    }
    HandlerErr::new(code, e.to_string()).with_details(json!({ "table": "students" }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_name = get_optional_str(params, "className");
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let mut stmt = conn
        .prepare(
            "SELECT id, nis, name, class_name, active, sort_order, updated_at
             FROM students
             WHERE (?1 IS NULL OR class_name = ?1)
             ORDER BY class_name, sort_order, name",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([class_name], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)? != 0,
                r.get::<_, i64>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let students: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|row| include_inactive || row.4)
        .map(|(id, nis, name, class_name, active, sort_order, updated_at)| {
            json!({
                "id": id,
                "nis": nis,
                "name": name,
                "className": class_name,
                "active": active,
                "sortOrder": sort_order,
                "updatedAt": updated_at,
            })
        })
        .collect();
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let nis = get_optional_str(params, "nis");
    let class_name = get_optional_str(params, "className").unwrap_or_default();
    let active = params.get("active").and_then(|v| v.as_bool()).unwrap_or(true);

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_name = ?",
            [&class_name],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, nis, name, class_name, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &nis,
            &name,
            &class_name,
            active as i64,
            next_sort,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| map_write_err(e, "db_insert_failed"))?;
    helpers::log_activity(
        conn,
        params,
        "students.create",
        json!({ "studentId": id, "name": name, "className": class_name }),
    );
    Ok(json!({ "studentId": id, "sortOrder": next_sort }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    if !helpers::student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (k, v) in patch {
        let (sql, value): (&str, rusqlite::types::Value) = match k.as_str() {
            "name" => {
                let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(HandlerErr::bad_params("name must be a non-empty string"));
                };
                ("UPDATE students SET name = ? WHERE id = ?", s.to_string().into())
            }
            "nis" => {
                let value = match v {
                    serde_json::Value::Null => rusqlite::types::Value::Null,
                    serde_json::Value::String(s) if s.trim().is_empty() => rusqlite::types::Value::Null,
                    serde_json::Value::String(s) => s.trim().to_string().into(),
                    _ => return Err(HandlerErr::bad_params("nis must be string or null")),
                };
                ("UPDATE students SET nis = ? WHERE id = ?", value)
            }
            "className" => {
                let Some(s) = v.as_str() else {
                    return Err(HandlerErr::bad_params("className must be a string"));
                };
                ("UPDATE students SET class_name = ? WHERE id = ?", s.trim().to_string().into())
            }
            "active" => {
                let Some(b) = v.as_bool() else {
                    return Err(HandlerErr::bad_params("active must be boolean"));
                };
                ("UPDATE students SET active = ? WHERE id = ?", (b as i64).into())
            }
            "sortOrder" => {
                let Some(n) = v.as_i64() else {
                    return Err(HandlerErr::bad_params("sortOrder must be integer"));
                };
                ("UPDATE students SET sort_order = ? WHERE id = ?", n.into())
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown student field: {}", k))),
        };
        tx.execute(sql, (value, &student_id))
            .map_err(|e| map_write_err(e, "db_update_failed"))?;
    }
    tx.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (db::now_rfc3339(), &student_id),
    )
    .map_err(|e| map_write_err(e, "db_update_failed"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    helpers::log_activity(
        conn,
        params,
        "students.update",
        json!({ "studentId": student_id, "fields": patch.keys().collect::<Vec<_>>() }),
    );
    Ok(json!({ "ok": true }))
}

/// Deletes a student and every grade they own. The grade delete runs first so a
/// failure part-way leaves the student row in place for a retry.
fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let name: Option<String> = conn
        .query_row("SELECT name FROM students WHERE id = ?", [&student_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(name) = name else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let deleted_grades = conn
        .execute("DELETE FROM grades WHERE student_id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": "grades" }))
        })?;
    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": "students" }))
        })?;

    helpers::log_activity(
        conn,
        params,
        "students.delete",
        json!({ "studentId": student_id, "name": name, "deletedGrades": deleted_grades }),
    );
    Ok(json!({ "ok": true, "deletedGrades": deleted_grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
