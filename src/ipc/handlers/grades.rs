use crate::db;
use crate::grade::{self, CompletionStatus, GradeRecord, Semester, WeightConfiguration};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::settings;
use crate::ipc::helpers::{
    self, get_optional_str, get_required_semester, get_required_str, with_conn, GradeFilters,
    GradeRow,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const GRADES_BULK_IMPORT_MAX_ROWS: usize = 2000;

/// The uniqueness key of a grade record.
#[derive(Debug, Clone)]
struct GradeKey {
    student_id: String,
    subject: String,
    semester: Semester,
    academic_year: String,
    teacher_id: String,
}

struct SavedGrade {
    grade_id: String,
    final_grade: f64,
    created: bool,
}

fn completion_json(status: &CompletionStatus, kkm: f64) -> serde_json::Value {
    json!({
        "kkm": kkm,
        "complete": status.complete,
        "label": status.label(),
        "failingComponents": status.failing_components,
    })
}

fn parse_common_key(params: &serde_json::Value) -> Result<(String, Semester, String, String), HandlerErr> {
    Ok((
        get_required_str(params, "subject")?,
        get_required_semester(params)?,
        get_required_str(params, "academicYear")?,
        get_required_str(params, "teacherId")?,
    ))
}

fn upsert_grade(
    conn: &Connection,
    key: &GradeKey,
    record: &GradeRecord,
    weights: &WeightConfiguration,
) -> Result<SavedGrade, HandlerErr> {
    let final_grade = grade::compute_final_grade(record, weights)?;
    let assignments_json = serde_json::to_string(&record.assignment_scores)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grades
             WHERE student_id = ? AND subject = ? AND semester = ? AND academic_year = ? AND teacher_id = ?",
            (
                &key.student_id,
                &key.subject,
                key.semester.as_str(),
                &key.academic_year,
                &key.teacher_id,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let grade_id = existing.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

    conn.execute(
        "INSERT INTO grades(
            id, student_id, subject, semester, academic_year, teacher_id,
            assignment_scores, test_score, midterm_score, final_score, attendance_percent,
            extracurricular_score, student_council_score, final_grade, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(student_id, subject, semester, academic_year, teacher_id) DO UPDATE SET
           assignment_scores = excluded.assignment_scores,
           test_score = excluded.test_score,
           midterm_score = excluded.midterm_score,
           final_score = excluded.final_score,
           attendance_percent = excluded.attendance_percent,
           extracurricular_score = excluded.extracurricular_score,
           student_council_score = excluded.student_council_score,
           final_grade = excluded.final_grade,
           updated_at = excluded.updated_at",
        rusqlite::params![
            grade_id,
            key.student_id,
            key.subject,
            key.semester.as_str(),
            key.academic_year,
            key.teacher_id,
            assignments_json,
            record.test_score,
            record.midterm_score,
            record.final_score,
            record.attendance_percent,
            record.extracurricular_score,
            record.student_council_score,
            final_grade,
            db::now_rfc3339(),
        ],
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "grades" }))
    })?;

    Ok(SavedGrade {
        grade_id,
        final_grade,
        created: existing.is_none(),
    })
}

fn handle_calc_final_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let mut weights = match state.db.as_ref() {
        Some(conn) => match helpers::load_weights(conn) {
            Ok(w) => w,
            Err(e) => return e.response(&req.id),
        },
        None => WeightConfiguration::default(),
    };
    // Overrides go through the same field checks as settings.weights.update.
    if let Some(raw) = req.params.get("weights").filter(|v| !v.is_null()) {
        let Some(patch) = raw.as_object() else {
            return err(&req.id, "bad_params", "weights must be an object", None);
        };
        if let Err(msg) = settings::merge_weights_patch(&mut weights, patch) {
            return err(&req.id, "bad_params", format!("weights: {}", msg), None);
        }
    }
    let semester = match req.params.get("semester") {
        Some(v) if !v.is_null() => match Semester::parse(v) {
            Some(s) => s,
            None => return err(&req.id, "bad_params", "unknown semester", None),
        },
        _ => Semester::Odd,
    };
    let kkm = match req.params.get("kkm") {
        None => grade::DEFAULT_KKM,
        Some(v) if v.is_null() => grade::DEFAULT_KKM,
        Some(v) => match v.as_f64() {
            Some(n) => n,
            None => return err(&req.id, "bad_params", "kkm must be a number", None),
        },
    };
    let Some(raw_record) = req.params.get("record") else {
        return err(&req.id, "bad_params", "missing record", None);
    };

    let result = grade::parse_grade_record(raw_record, weights.effective_days(semester))
        .and_then(|record| {
            let final_grade = grade::compute_final_grade(&record, &weights)?;
            Ok((record, final_grade))
        });
    match result {
        Ok((record, final_grade)) => {
            let status = grade::is_complete(&record, final_grade, kkm);
            ok(
                &req.id,
                json!({
                    "record": record,
                    "average": grade::round_off_2_decimals(grade::compute_average(&record.assignment_scores)),
                    "finalGrade": final_grade,
                    "completion": completion_json(&status, kkm),
                }),
            )
        }
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn grades_save(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let (subject, semester, academic_year, teacher_id) = parse_common_key(params)?;
    let raw_record = params
        .get("record")
        .ok_or_else(|| HandlerErr::bad_params("missing record"))?;

    if !helpers::student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    if !helpers::teacher_exists(conn, &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    let weights = helpers::load_weights(conn)?;
    let record = grade::parse_grade_record(raw_record, weights.effective_days(semester))?;
    let key = GradeKey {
        student_id,
        subject,
        semester,
        academic_year,
        teacher_id,
    };
    let saved = upsert_grade(conn, &key, &record, &weights)?;
    let kkm = helpers::load_kkm(conn, &key.subject, &key.academic_year)?;
    let status = grade::is_complete(&record, saved.final_grade, kkm);

    helpers::log_activity(
        conn,
        params,
        "grades.save",
        json!({
            "gradeId": saved.grade_id,
            "studentId": key.student_id,
            "subject": key.subject,
            "semester": key.semester,
            "academicYear": key.academic_year,
            "finalGrade": saved.final_grade,
            "created": saved.created,
        }),
    );
    Ok(json!({
        "gradeId": saved.grade_id,
        "created": saved.created,
        "finalGrade": saved.final_grade,
        "completion": completion_json(&status, kkm),
    }))
}

fn row_json(row: &GradeRow, kkm: f64, status: &CompletionStatus) -> serde_json::Value {
    let mut v = serde_json::to_value(row).unwrap_or_else(|_| json!({}));
    v["completion"] = completion_json(status, kkm);
    v
}

fn single_row_json(conn: &Connection, row: GradeRow) -> Result<serde_json::Value, HandlerErr> {
    let mut with_status = helpers::grade_rows_with_status(conn, vec![row])?;
    let (row, kkm, status) = with_status.remove(0);
    Ok(row_json(&row, kkm, &status))
}

/// Looks a record up by `gradeId`, or by its full uniqueness key.
fn grades_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    if let Some(grade_id) = get_optional_str(params, "gradeId") {
        let student_id: Option<String> = conn
            .query_row("SELECT student_id FROM grades WHERE id = ?", [&grade_id], |r| r.get(0))
            .optional()
            .map_err(HandlerErr::query)?;
        let Some(student_id) = student_id else {
            return Err(HandlerErr::not_found("grade not found"));
        };
        let rows = helpers::query_grade_rows(
            conn,
            &GradeFilters {
                student_id: Some(student_id),
                ..GradeFilters::default()
            },
        )?;
        let Some(row) = rows.into_iter().find(|r| r.grade_id == grade_id) else {
            return Err(HandlerErr::not_found("grade not found"));
        };
        return single_row_json(conn, row);
    }

    let (subject, semester, academic_year, teacher_id) = parse_common_key(params)?;
    let filters = GradeFilters {
        subject: Some(subject),
        semester: Some(semester),
        academic_year: Some(academic_year),
        teacher_id: Some(teacher_id),
        student_id: Some(get_required_str(params, "studentId")?),
        class_name: None,
    };
    let rows = helpers::query_grade_rows(conn, &filters)?;
    let Some(row) = rows.into_iter().next() else {
        return Err(HandlerErr::not_found("grade not found"));
    };
    single_row_json(conn, row)
}

fn grades_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let filters = GradeFilters::from_params(params)?;
    let rows = helpers::query_grade_rows(conn, &filters)?;
    let with_status = helpers::grade_rows_with_status(conn, rows)?;

    let finals: Vec<f64> = with_status.iter().map(|(r, _, _)| r.final_grade).collect();
    let complete_count = with_status.iter().filter(|(_, _, s)| s.complete).count();
    let rows_json: Vec<serde_json::Value> = with_status
        .iter()
        .map(|(row, kkm, status)| row_json(row, *kkm, status))
        .collect();

    Ok(json!({
        "rows": rows_json,
        "summary": {
            "count": finals.len(),
            "averageFinalGrade": grade::round_off_2_decimals(grade::compute_average(&finals)),
            "completeCount": complete_count,
            "incompleteCount": finals.len() - complete_count,
        }
    }))
}

fn grades_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let changed = conn
        .execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("grade not found"));
    }
    helpers::log_activity(conn, params, "grades.delete", json!({ "gradeId": grade_id }));
    Ok(json!({ "ok": true }))
}

fn resolve_import_student(conn: &Connection, row: &serde_json::Value) -> Result<String, HandlerErr> {
    if let Some(student_id) = get_optional_str(row, "studentId") {
        if helpers::student_exists(conn, &student_id)? {
            return Ok(student_id);
        }
        return Err(HandlerErr::not_found("student not found")
            .with_details(json!({ "studentId": student_id })));
    }
    // Spreadsheets often carry NIS as a number.
    let nis = match row.get("nis") {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(HandlerErr::bad_params("row needs studentId or nis")),
    };
    let found: Option<String> = conn
        .query_row("SELECT id FROM students WHERE nis = ?", [&nis], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    found.ok_or_else(|| HandlerErr::not_found("student not found").with_details(json!({ "nis": nis })))
}

fn import_row(
    conn: &Connection,
    row: &serde_json::Value,
    template: &GradeKey,
    weights: &WeightConfiguration,
    effective_days: u32,
) -> Result<SavedGrade, HandlerErr> {
    if !row.is_object() {
        return Err(HandlerErr::bad_params("row must be an object"));
    }
    let student_id = resolve_import_student(conn, row)?;
    let record = grade::parse_grade_record(row, effective_days)?;
    let key = GradeKey {
        student_id,
        ..template.clone()
    };
    upsert_grade(conn, &key, &record, weights)
}

/// Imports rows one by one. Rows that fail are reported and skipped; rows already
/// written stay written.
fn grades_bulk_import(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (subject, semester, academic_year, teacher_id) = parse_common_key(params)?;
    let Some(rows) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing rows[]"));
    };
    if !helpers::teacher_exists(conn, &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    if rows.len() > GRADES_BULK_IMPORT_MAX_ROWS {
        return Ok(json!({
            "imported": 0,
            "rejected": rows.len(),
            "limitExceeded": true,
            "errors": [{
                "row": -1,
                "code": "too_many_rows",
                "message": format!(
                    "import exceeds max rows: {} > {}",
                    rows.len(),
                    GRADES_BULK_IMPORT_MAX_ROWS
                )
            }]
        }));
    }

    let weights = helpers::load_weights(conn)?;
    let effective_days = weights.effective_days(semester);
    let template = GradeKey {
        student_id: String::new(),
        subject: subject.clone(),
        semester,
        academic_year: academic_year.clone(),
        teacher_id: teacher_id.clone(),
    };
    let mut imported = 0usize;
    let mut created = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        match import_row(conn, row, &template, &weights, effective_days) {
            Ok(saved) => {
                imported += 1;
                if saved.created {
                    created += 1;
                }
            }
            Err(e) => {
                tracing::warn!(row = i, code = e.code, message = %e.message, "import row rejected");
                errors.push(e.to_row_error(i));
            }
        }
    }

    helpers::log_activity(
        conn,
        params,
        "grades.bulkImport",
        json!({
            "subject": subject,
            "semester": semester,
            "academicYear": academic_year,
            "imported": imported,
            "rejected": errors.len(),
        }),
    );
    Ok(json!({
        "imported": imported,
        "created": created,
        "updated": imported - created,
        "rejected": errors.len(),
        "errors": errors,
    }))
}

fn grades_recompute_all(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let weights = helpers::load_weights(conn)?;
    let rows = helpers::query_grade_rows(conn, &GradeFilters::default())?;
    let mut changed = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for row in &rows {
        let recomputed = match grade::compute_final_grade(&row.record, &weights) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({ "gradeId": row.grade_id, "message": e.to_string() }));
                continue;
            }
        };
        if (recomputed - row.final_grade).abs() < 1e-9 {
            continue;
        }
        conn.execute(
            "UPDATE grades SET final_grade = ?, updated_at = ? WHERE id = ?",
            (recomputed, db::now_rfc3339(), &row.grade_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        changed += 1;
    }
    helpers::log_activity(
        conn,
        params,
        "grades.recomputeAll",
        json!({ "checked": rows.len(), "changed": changed }),
    );
    Ok(json!({ "checked": rows.len(), "changed": changed, "errors": errors }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.finalGrade" => Some(handle_calc_final_grade(state, req)),
        "grades.save" => Some(with_conn(state, req, grades_save)),
        "grades.get" => Some(with_conn(state, req, grades_get)),
        "grades.list" => Some(with_conn(state, req, grades_list)),
        "grades.delete" => Some(with_conn(state, req, grades_delete)),
        "grades.bulkImport" => Some(with_conn(state, req, grades_bulk_import)),
        "grades.recomputeAll" => Some(with_conn(state, req, grades_recompute_all)),
        _ => None,
    }
}
