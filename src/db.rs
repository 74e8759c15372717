use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

const DB_FILE_NAME: &str = "smapna.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            nis TEXT UNIQUE,
            name TEXT NOT NULL,
            class_name TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_name, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            nip TEXT UNIQUE,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS kkm_settings(
            subject TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            threshold REAL NOT NULL,
            PRIMARY KEY(subject, academic_year)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            semester TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            assignment_scores TEXT NOT NULL,
            test_score REAL NOT NULL DEFAULT 0,
            midterm_score REAL NOT NULL DEFAULT 0,
            final_score REAL NOT NULL DEFAULT 0,
            attendance_percent REAL NOT NULL DEFAULT 0,
            extracurricular_score REAL NOT NULL DEFAULT 0,
            student_council_score REAL NOT NULL DEFAULT 0,
            final_grade REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(student_id, subject, semester, academic_year, teacher_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_recap ON grades(subject, academic_year, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS holidays(
            date TEXT PRIMARY KEY,
            description TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_attendance(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(teacher_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_attendance_date ON teacher_attendance(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_log(
            id TEXT PRIMARY KEY,
            at TEXT NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            detail_json TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_log_at ON activity_log(at)",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {} is not valid JSON", key))?,
        )),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn activity_log_append(
    conn: &Connection,
    actor: &str,
    action: &str,
    detail: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO activity_log(id, at, actor, action, detail_json) VALUES(?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            now_rfc3339(),
            actor,
            action,
            serde_json::to_string(detail)?,
        ),
    )
    .context("failed to append activity log")?;
    Ok(())
}

pub fn activity_log_list(conn: &Connection, limit: i64) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, at, actor, action, detail_json
         FROM activity_log
         ORDER BY at DESC, rowid DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(id, at, actor, action, detail)| {
            serde_json::json!({
                "id": id,
                "at": at,
                "actor": actor,
                "action": action,
                "detail": serde_json::from_str::<serde_json::Value>(&detail)
                    .unwrap_or(serde_json::Value::Null),
            })
        })
        .collect())
}
