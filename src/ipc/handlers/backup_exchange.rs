use crate::backup;
use crate::db;
use crate::grade;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{self, get_required_str, GradeFilters};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

const GRADES_CSV_HEADER: &str = "nis,name,class,subject,semester,academic_year,assignment_average,\
test,midterm,final,attendance_percent,extracurricular,student_council,final_grade,kkm,status\n";

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn io_err(e: impl std::fmt::Display, path: &Path) -> HandlerErr {
    HandlerErr::new("io_failed", e.to_string())
        .with_details(json!({ "path": path.to_string_lossy() }))
}

fn workspace_or_err(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn backup_export(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);
    let workspace_path = workspace_or_err(state)?;

    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(FULL)") {
            tracing::warn!(error = %e, "wal checkpoint before export failed");
        }
    }

    let export = backup::export_workspace_bundle(&workspace_path, &out_path)
        .map_err(|e| io_err(format!("{:#}", e), &out_path))?;
    if let Some(conn) = state.db.as_ref() {
        helpers::log_activity(
            conn,
            params,
            "backup.export",
            json!({ "path": out_path.to_string_lossy(), "dbSha256": export.db_sha256 }),
        );
    }
    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "dbSha256": export.db_sha256,
    }))
}

fn backup_import(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let in_path = PathBuf::from(get_required_str(params, "inPath")?);
    let workspace_path = workspace_or_err(state)?;
    if !in_path.is_file() {
        return Err(HandlerErr::not_found("bundle file not found")
            .with_details(json!({ "path": in_path.to_string_lossy() })));
    }

    // Drop open handle before replacing file.
    state.db = None;
    let imported = backup::import_workspace_bundle(&in_path, &workspace_path);
    let conn = db::open_db(&workspace_path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{:#}", e)))?;
    state.db = Some(conn);
    let import = imported.map_err(|e| io_err(format!("{:#}", e), &in_path))?;

    if let Some(conn) = state.db.as_ref() {
        helpers::log_activity(
            conn,
            params,
            "backup.import",
            json!({ "path": in_path.to_string_lossy(), "dbSha256": import.db_sha256 }),
        );
    }
    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "dbSha256": import.db_sha256,
    }))
}

fn fmt_score(v: f64) -> String {
    grade::round_off_2_decimals(v).to_string()
}

fn export_grades_csv(
    conn: &rusqlite::Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);
    let filter_params = params.get("filters").unwrap_or(params);
    let filters = GradeFilters::from_params(filter_params)?;
    let rows = helpers::query_grade_rows(conn, &filters)?;
    let rows = helpers::grade_rows_with_status(conn, rows)?;

    let mut csv = String::from(GRADES_CSV_HEADER);
    let row_count = rows.len();
    for (row, kkm, status) in rows {
        let fields = [
            csv_quote(row.nis.as_deref().unwrap_or("")),
            csv_quote(&row.student_name),
            csv_quote(&row.class_name),
            csv_quote(&row.subject),
            row.semester.as_str().to_string(),
            csv_quote(&row.academic_year),
            fmt_score(grade::compute_average(&row.record.assignment_scores)),
            fmt_score(row.record.test_score),
            fmt_score(row.record.midterm_score),
            fmt_score(row.record.final_score),
            fmt_score(row.record.attendance_percent),
            fmt_score(row.record.extracurricular_score),
            fmt_score(row.record.student_council_score),
            fmt_score(row.final_grade),
            fmt_score(kkm),
            status.label().to_string(),
        ];
        csv.push_str(&fields.join(","));
        csv.push('\n');
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(e, &out_path))?;
    }
    std::fs::write(&out_path, csv).map_err(|e| io_err(e, &out_path))?;
    tracing::info!(rows = row_count, path = %out_path.display(), "grades csv exported");

    Ok(json!({
        "ok": true,
        "rowCount": row_count,
        "path": out_path.to_string_lossy(),
    }))
}

fn respond(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(respond(req, backup_export(state, &req.params))),
        "backup.importWorkspaceBundle" => Some(respond(req, backup_import(state, &req.params))),
        "exchange.exportGradesCsv" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(respond(req, export_grades_csv(conn, &req.params)))
        }
        _ => None,
    }
}
