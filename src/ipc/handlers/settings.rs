use crate::db;
use crate::grade::WeightConfiguration;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{self, get_required_str, with_conn, WEIGHTS_SETTINGS_KEY};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

pub(crate) fn merge_weights_patch(current: &mut WeightConfiguration, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "assignmentWeight" => current.assignment_weight = parse_i64_range(v, k, 0, 100)? as f64,
            "testWeight" => current.test_weight = parse_i64_range(v, k, 0, 100)? as f64,
            "midtermWeight" => current.midterm_weight = parse_i64_range(v, k, 0, 100)? as f64,
            "finalWeight" => current.final_weight = parse_i64_range(v, k, 0, 100)? as f64,
            "attendanceWeight" => current.attendance_weight = parse_i64_range(v, k, 0, 100)? as f64,
            "extracurricularBonusMax" => {
                current.extracurricular_bonus_max = parse_f64_range(v, k, 0.0, 100.0)?
            }
            "studentCouncilBonusMax" => {
                current.student_council_bonus_max = parse_f64_range(v, k, 0.0, 100.0)?
            }
            "effectiveDaysOddSemester" => {
                current.effective_days_odd_semester = parse_i64_range(v, k, 1, 366)? as u32
            }
            "effectiveDaysEvenSemester" => {
                current.effective_days_even_semester = parse_i64_range(v, k, 1, 366)? as u32
            }
            _ => return Err(format!("unknown weights field: {}", k)),
        }
    }
    Ok(())
}

fn weights_json(w: &WeightConfiguration) -> Value {
    let total = w.academic_total();
    json!({
        "weights": w,
        "academicWeightTotal": total,
        "academicWeightTotalIs100": (total - 100.0).abs() < 1e-9,
    })
}

fn handle_weights_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match helpers::load_weights(conn) {
        Ok(w) => ok(&req.id, weights_json(&w)),
        Err(e) => e.response(&req.id),
    }
}

fn handle_weights_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match helpers::load_weights(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(msg) = merge_weights_patch(&mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    let stored = match serde_json::to_value(&current) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = db::settings_set_json(conn, WEIGHTS_SETTINGS_KEY, &stored) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if (current.academic_total() - 100.0).abs() >= 1e-9 {
        tracing::warn!(total = current.academic_total(), "academic weights do not sum to 100");
    }
    helpers::log_activity(
        conn,
        &req.params,
        "settings.weights.update",
        json!({ "patch": Value::Object(patch_obj.clone()) }),
    );
    ok(&req.id, weights_json(&current))
}

fn kkm_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let subject = get_required_str(params, "subject")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let explicit: Option<f64> = conn
        .query_row(
            "SELECT threshold FROM kkm_settings WHERE subject = ? AND academic_year = ?",
            (&subject, &academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let threshold = explicit.unwrap_or(crate::grade::DEFAULT_KKM);
    Ok(json!({
        "subject": subject,
        "academicYear": academic_year,
        "threshold": threshold,
        "isDefault": explicit.is_none(),
    }))
}

fn kkm_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let subject = get_required_str(params, "subject")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let threshold = params
        .get("threshold")
        .ok_or_else(|| HandlerErr::bad_params("missing threshold"))
        .and_then(|v| parse_f64_range(v, "threshold", 0.0, 100.0).map_err(HandlerErr::bad_params))?;
    conn.execute(
        "INSERT INTO kkm_settings(subject, academic_year, threshold)
         VALUES(?, ?, ?)
         ON CONFLICT(subject, academic_year) DO UPDATE SET threshold = excluded.threshold",
        (&subject, &academic_year, threshold),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "kkm_settings" }))
    })?;
    helpers::log_activity(
        conn,
        params,
        "kkm.set",
        json!({ "subject": subject, "academicYear": academic_year, "threshold": threshold }),
    );
    Ok(json!({ "ok": true, "threshold": threshold }))
}

fn kkm_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let year = helpers::get_optional_str(params, "academicYear");
    let mut stmt = conn
        .prepare(
            "SELECT subject, academic_year, threshold
             FROM kkm_settings
             WHERE (?1 IS NULL OR academic_year = ?1)
             ORDER BY academic_year, subject",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([year], |r| {
            Ok(json!({
                "subject": r.get::<_, String>(0)?,
                "academicYear": r.get::<_, String>(1)?,
                "threshold": r.get::<_, f64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "defaultThreshold": crate::grade::DEFAULT_KKM, "items": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "settings.weights.get" => Some(handle_weights_get(state, req)),
        "settings.weights.update" => Some(handle_weights_update(state, req)),
        "kkm.get" => Some(with_conn(state, req, kkm_get)),
        "kkm.set" => Some(with_conn(state, req, kkm_set)),
        "kkm.list" => Some(with_conn(state, req, kkm_list)),
        _ => None,
    }
}
