use crate::db;
use crate::grade::{self, CompletionStatus, GradeRecord, Semester, WeightConfiguration};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

pub const WEIGHTS_SETTINGS_KEY: &str = "grading.weights";

/// Runs `f` against the open workspace and wraps its outcome in a response envelope.
pub fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_semester(params: &serde_json::Value) -> Result<Semester, HandlerErr> {
    let raw = params
        .get("semester")
        .ok_or_else(|| HandlerErr::bad_params("missing semester"))?;
    Semester::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("semester must be one of: odd, even, ganjil, genap, 1, 2"))
}

pub fn get_optional_semester(params: &serde_json::Value) -> Result<Option<Semester>, HandlerErr> {
    match params.get("semester") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(_) => get_required_semester(params).map(Some),
    }
}

pub fn actor(params: &serde_json::Value) -> String {
    get_optional_str(params, "actor").unwrap_or_else(|| "system".to_string())
}

/// Appends to the activity log. A failed append never fails the mutation it records.
pub fn log_activity(
    conn: &Connection,
    params: &serde_json::Value,
    action: &str,
    detail: serde_json::Value,
) {
    let who = actor(params);
    tracing::info!(actor = %who, action, "activity");
    if let Err(e) = db::activity_log_append(conn, &who, action, &detail) {
        tracing::warn!(error = %e, action, "activity log append failed");
    }
}

/// Stored weights merged over defaults; unreadable settings fall back to defaults.
pub fn load_weights(conn: &Connection) -> Result<WeightConfiguration, HandlerErr> {
    let saved = db::settings_get_json(conn, WEIGHTS_SETTINGS_KEY).map_err(HandlerErr::query)?;
    let Some(saved) = saved else {
        return Ok(WeightConfiguration::default());
    };
    match serde_json::from_value::<WeightConfiguration>(saved) {
        Ok(w) => Ok(w),
        Err(e) => {
            tracing::warn!(error = %e, "stored weights are malformed; using defaults");
            Ok(WeightConfiguration::default())
        }
    }
}

pub fn load_kkm(conn: &Connection, subject: &str, academic_year: &str) -> Result<f64, HandlerErr> {
    let threshold: Option<f64> = conn
        .query_row(
            "SELECT threshold FROM kkm_settings WHERE subject = ? AND academic_year = ?",
            (subject, academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    Ok(threshold.unwrap_or(grade::DEFAULT_KKM))
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

pub fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

#[derive(Debug, Clone, Default)]
pub struct GradeFilters {
    pub subject: Option<String>,
    pub semester: Option<Semester>,
    pub academic_year: Option<String>,
    pub teacher_id: Option<String>,
    pub class_name: Option<String>,
    pub student_id: Option<String>,
}

impl GradeFilters {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, HandlerErr> {
        Ok(Self {
            subject: get_optional_str(params, "subject"),
            semester: get_optional_semester(params)?,
            academic_year: get_optional_str(params, "academicYear"),
            teacher_id: get_optional_str(params, "teacherId"),
            class_name: get_optional_str(params, "className"),
            student_id: get_optional_str(params, "studentId"),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub grade_id: String,
    pub student_id: String,
    pub nis: Option<String>,
    pub student_name: String,
    pub class_name: String,
    pub subject: String,
    pub semester: Semester,
    pub academic_year: String,
    pub teacher_id: String,
    #[serde(flatten)]
    pub record: GradeRecord,
    pub final_grade: f64,
    pub updated_at: Option<String>,
}

fn semester_from_db(raw: &str, grade_id: &str) -> Result<Semester, HandlerErr> {
    Semester::parse(&serde_json::Value::String(raw.to_string())).ok_or_else(|| {
        tracing::warn!(grade_id, semester = raw, "corrupt stored semester");
        HandlerErr::new("db_query_failed", format!("corrupt semester: {}", raw))
            .with_details(json!({ "gradeId": grade_id }))
    })
}

pub fn query_grade_rows(conn: &Connection, filters: &GradeFilters) -> Result<Vec<GradeRow>, HandlerErr> {
    let mut sql = String::from(
        "SELECT g.id, g.student_id, s.nis, s.name, s.class_name, g.subject, g.semester,
                g.academic_year, g.teacher_id, g.assignment_scores, g.test_score,
                g.midterm_score, g.final_score, g.attendance_percent,
                g.extracurricular_score, g.student_council_score, g.final_grade, g.updated_at
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE 1 = 1",
    );
    let mut binds: Vec<SqlValue> = Vec::new();
    let mut push = |clause: &str, v: String| {
        sql.push_str(clause);
        binds.push(SqlValue::Text(v));
    };
    if let Some(v) = &filters.subject {
        push(" AND g.subject = ?", v.clone());
    }
    if let Some(v) = filters.semester {
        push(" AND g.semester = ?", v.as_str().to_string());
    }
    if let Some(v) = &filters.academic_year {
        push(" AND g.academic_year = ?", v.clone());
    }
    if let Some(v) = &filters.teacher_id {
        push(" AND g.teacher_id = ?", v.clone());
    }
    if let Some(v) = &filters.class_name {
        push(" AND s.class_name = ?", v.clone());
    }
    if let Some(v) = &filters.student_id {
        push(" AND g.student_id = ?", v.clone());
    }
    sql.push_str(" ORDER BY s.class_name, s.sort_order, s.name, g.subject, g.semester");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let raw_rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                (
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, String>(8)?,
                ),
                (
                    r.get::<_, String>(9)?,
                    r.get::<_, f64>(10)?,
                    r.get::<_, f64>(11)?,
                    r.get::<_, f64>(12)?,
                    r.get::<_, f64>(13)?,
                    r.get::<_, f64>(14)?,
                    r.get::<_, f64>(15)?,
                    r.get::<_, f64>(16)?,
                    r.get::<_, Option<String>>(17)?,
                ),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut out = Vec::with_capacity(raw_rows.len());
    for (head, scores) in raw_rows {
        let (grade_id, student_id, nis, student_name, class_name, subject, semester, academic_year, teacher_id) =
            head;
        let (assignments_json, test, midterm, final_exam, attendance, extracurricular, council, final_grade, updated_at) =
            scores;
        let semester = semester_from_db(&semester, &grade_id)?;
        let assignment_scores: Vec<f64> = serde_json::from_str(&assignments_json).map_err(|e| {
            HandlerErr::new("db_query_failed", format!("corrupt assignment scores: {}", e))
                .with_details(json!({ "gradeId": grade_id }))
        })?;
        out.push(GradeRow {
            grade_id,
            student_id,
            nis,
            student_name,
            class_name,
            subject,
            semester,
            academic_year,
            teacher_id,
            record: GradeRecord {
                assignment_scores,
                test_score: test,
                midterm_score: midterm,
                final_score: final_exam,
                attendance_percent: attendance,
                extracurricular_score: extracurricular,
                student_council_score: council,
            },
            final_grade,
            updated_at,
        });
    }
    Ok(out)
}

/// Row plus its completion status, with KKM thresholds looked up once per
/// (subject, academic year).
pub fn grade_rows_with_status(
    conn: &Connection,
    rows: Vec<GradeRow>,
) -> Result<Vec<(GradeRow, f64, CompletionStatus)>, HandlerErr> {
    let mut kkm_cache: std::collections::HashMap<(String, String), f64> =
        std::collections::HashMap::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let key = (row.subject.clone(), row.academic_year.clone());
        let kkm = match kkm_cache.get(&key) {
            Some(v) => *v,
            None => {
                let v = load_kkm(conn, &row.subject, &row.academic_year)?;
                kkm_cache.insert(key, v);
                v
            }
        };
        let status = grade::is_complete(&row.record, row.final_grade, kkm);
        out.push((row, kkm, status));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_semester_must_be_known() {
        assert_eq!(semester_from_db("odd", "g1").ok(), Some(Semester::Odd));
        assert_eq!(semester_from_db("even", "g1").ok(), Some(Semester::Even));
        let err = semester_from_db("summer", "g2").err().expect("corrupt semester");
        assert_eq!(err.code, "db_query_failed");
        assert_eq!(err.details, Some(json!({ "gradeId": "g2" })));
    }
}
