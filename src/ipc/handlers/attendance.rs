use crate::grade;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, get_optional_str, get_required_str, with_conn};
use crate::ipc::types::{AppState, Request};
use crate::workdays::{self, parse_date, parse_month_key};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

const STATUSES: [&str; 4] = ["present", "permit", "sick", "absent"];

fn parse_status(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "present" | "hadir" | "h" => Some("present"),
        "permit" | "izin" | "i" => Some("permit"),
        "sick" | "sakit" | "s" => Some("sick"),
        "absent" | "alpa" | "alpha" | "a" => Some("absent"),
        _ => None,
    }
}

fn month_range(params: &serde_json::Value) -> Result<(String, i32, u32, NaiveDate, NaiveDate), HandlerErr> {
    let month_key = get_required_str(params, "month")?;
    let (year, month) = parse_month_key(&month_key)?;
    let (first, last) = workdays::month_bounds(year, month)?;
    Ok((month_key, year, month, first, last))
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn holidays_between(
    conn: &Connection,
    first: NaiveDate,
    last: NaiveDate,
) -> Result<Vec<(String, String)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT date, description FROM holidays
             WHERE date BETWEEN ? AND ?
             ORDER BY date",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map((fmt_date(first), fmt_date(last)), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(rows)
}

fn attendance_dates_between(
    conn: &Connection,
    first: NaiveDate,
    last: NaiveDate,
) -> Result<Vec<NaiveDate>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT date FROM teacher_attendance WHERE date BETWEEN ? AND ?")
        .map_err(HandlerErr::query)?;
    let raw = stmt
        .query_map((fmt_date(first), fmt_date(last)), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut out = Vec::with_capacity(raw.len());
    for d in raw {
        match parse_date(&d) {
            Ok(v) => out.push(v),
            Err(e) => tracing::warn!(error = %e, "skipping malformed attendance date"),
        }
    }
    Ok(out)
}

fn workdays_for_month(
    conn: &Connection,
    year: i32,
    month: u32,
    first: NaiveDate,
    last: NaiveDate,
) -> Result<(u32, Vec<(String, String)>), HandlerErr> {
    let holidays = holidays_between(conn, first, last)?;
    let mut holiday_set: HashSet<NaiveDate> = HashSet::new();
    for (d, _) in &holidays {
        holiday_set.insert(parse_date(d)?);
    }
    let attendance = attendance_dates_between(conn, first, last)?;
    let count = workdays::count_workdays(year, month, &holiday_set, attendance)?;
    Ok((count, holidays))
}

fn attendance_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let status_raw = get_required_str(params, "status")?;
    let Some(status) = parse_status(&status_raw) else {
        return Err(HandlerErr::bad_params(format!(
            "status must be one of: {}",
            STATUSES.join(", ")
        )));
    };
    let note = get_optional_str(params, "note");
    if !helpers::teacher_exists(conn, &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    conn.execute(
        "INSERT INTO teacher_attendance(id, teacher_id, date, status, note)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(teacher_id, date) DO UPDATE SET
           status = excluded.status,
           note = excluded.note",
        (Uuid::new_v4().to_string(), &teacher_id, fmt_date(date), status, &note),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "teacher_attendance" }))
    })?;
    helpers::log_activity(
        conn,
        params,
        "attendance.record",
        json!({ "teacherId": teacher_id, "date": fmt_date(date), "status": status }),
    );
    Ok(json!({ "ok": true, "status": status }))
}

fn attendance_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let changed = conn
        .execute(
            "DELETE FROM teacher_attendance WHERE teacher_id = ? AND date = ?",
            (&teacher_id, fmt_date(date)),
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("attendance record not found"));
    }
    helpers::log_activity(
        conn,
        params,
        "attendance.delete",
        json!({ "teacherId": teacher_id, "date": fmt_date(date) }),
    );
    Ok(json!({ "ok": true }))
}

fn attendance_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (month_key, _, _, first, last) = month_range(params)?;
    let teacher_id = get_optional_str(params, "teacherId");
    let mut stmt = conn
        .prepare(
            "SELECT a.teacher_id, t.name, a.date, a.status, a.note
             FROM teacher_attendance a
             JOIN teachers t ON t.id = a.teacher_id
             WHERE a.date BETWEEN ?1 AND ?2 AND (?3 IS NULL OR a.teacher_id = ?3)
             ORDER BY a.date, t.name",
        )
        .map_err(HandlerErr::query)?;
    let records = stmt
        .query_map((fmt_date(first), fmt_date(last), &teacher_id), |r| {
            Ok(json!({
                "teacherId": r.get::<_, String>(0)?,
                "teacherName": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "note": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "month": month_key, "records": records }))
}

/// Working days for the month plus each active teacher's status counts and
/// presence percentage over those working days.
fn attendance_month_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (month_key, year, month, first, last) = month_range(params)?;
    let (workday_count, _) = workdays_for_month(conn, year, month, first, last)?;

    let mut teachers_stmt = conn
        .prepare("SELECT id, name FROM teachers WHERE active = 1 ORDER BY name")
        .map_err(HandlerErr::query)?;
    let teachers = teachers_stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut counts_stmt = conn
        .prepare(
            "SELECT teacher_id, status, COUNT(*)
             FROM teacher_attendance
             WHERE date BETWEEN ? AND ?
             GROUP BY teacher_id, status",
        )
        .map_err(HandlerErr::query)?;
    let count_rows = counts_stmt
        .query_map((fmt_date(first), fmt_date(last)), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut by_teacher: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    for (teacher_id, status, n) in count_rows {
        by_teacher.entry(teacher_id).or_default().insert(status, n);
    }

    let rows: Vec<serde_json::Value> = teachers
        .into_iter()
        .map(|(id, name)| {
            let counts = by_teacher.remove(&id).unwrap_or_default();
            let get = |k: &str| counts.get(k).copied().unwrap_or(0);
            let present = get("present");
            json!({
                "teacherId": id,
                "name": name,
                "present": present,
                "permit": get("permit"),
                "sick": get("sick"),
                "absent": get("absent"),
                "presentPercent": grade::attendance_percent(present as f64, workday_count),
            })
        })
        .collect();

    Ok(json!({
        "month": month_key,
        "workdays": workday_count,
        "teachers": rows,
    }))
}

fn holidays_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let rows = if params.get("month").map(|v| !v.is_null()).unwrap_or(false) {
        let (_, _, _, first, last) = month_range(params)?;
        holidays_between(conn, first, last)?
    } else {
        let mut stmt = conn
            .prepare("SELECT date, description FROM holidays ORDER BY date")
            .map_err(HandlerErr::query)?;
        let all = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        all
    };
    let holidays: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(date, description)| json!({ "date": date, "description": description }))
        .collect();
    Ok(json!({ "holidays": holidays }))
}

fn holidays_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date(&get_required_str(params, "date")?)?;
    let description = get_optional_str(params, "description").unwrap_or_default();
    conn.execute(
        "INSERT INTO holidays(date, description) VALUES(?, ?)
         ON CONFLICT(date) DO UPDATE SET description = excluded.description",
        (fmt_date(date), &description),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string()).with_details(json!({ "table": "holidays" }))
    })?;
    helpers::log_activity(
        conn,
        params,
        "holidays.set",
        json!({ "date": fmt_date(date), "description": description }),
    );
    Ok(json!({ "ok": true }))
}

fn holidays_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date(&get_required_str(params, "date")?)?;
    let changed = conn
        .execute("DELETE FROM holidays WHERE date = ?", [fmt_date(date)])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("holiday not found"));
    }
    helpers::log_activity(conn, params, "holidays.delete", json!({ "date": fmt_date(date) }));
    Ok(json!({ "ok": true }))
}

fn calendar_workdays(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (month_key, year, month, first, last) = month_range(params)?;
    let (count, holidays) = workdays_for_month(conn, year, month, first, last)?;
    Ok(json!({
        "month": month_key,
        "workdays": count,
        "holidays": holidays.into_iter().map(|(d, _)| d).collect::<Vec<_>>(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(with_conn(state, req, attendance_record)),
        "attendance.delete" => Some(with_conn(state, req, attendance_delete)),
        "attendance.list" => Some(with_conn(state, req, attendance_list)),
        "attendance.monthSummary" => Some(with_conn(state, req, attendance_month_summary)),
        "holidays.list" => Some(with_conn(state, req, holidays_list)),
        "holidays.set" => Some(with_conn(state, req, holidays_set)),
        "holidays.delete" => Some(with_conn(state, req, holidays_delete)),
        "calendar.workdays" => Some(with_conn(state, req, calendar_workdays)),
        _ => None,
    }
}
