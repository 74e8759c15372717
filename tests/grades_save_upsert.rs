mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, select_workspace, spawn_sidecar, str_field};

#[test]
fn grades_save_computes_final_grade_and_upserts_on_key() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _workspace = select_workspace(&mut stdin, &mut reader, "smapna-grades-save");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "name": "Budi Santoso", "nis": "1001", "className": "X-1" }),
    );
    let student_id = str_field(&student, "studentId");
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "name": "Ibu Sari", "nip": "19800101" }),
    );
    let teacher_id = str_field(&teacher, "teacherId");

    let key = json!({
        "studentId": student_id,
        "subject": "Matematika",
        "semester": "ganjil",
        "academicYear": "2024/2025",
        "teacherId": teacher_id,
    });
    let mut first_params = key.clone();
    first_params["record"] = json!({
        "assignmentScores": [80, 90],
        "testScore": 85,
        "midtermScore": 88,
        "finalScore": 90,
        "attendancePercent": 100,
        "extracurricularScore": 100,
        "studentCouncilScore": 0
    });
    let first = request_ok(&mut stdin, &mut reader, "3", "grades.save", first_params);
    assert_eq!(first.get("created").and_then(|v| v.as_bool()), Some(true));
    let final_grade = first.get("finalGrade").and_then(|v| v.as_f64()).expect("finalGrade");
    assert!((final_grade - 94.1).abs() < 1e-9);
    assert_eq!(
        first.pointer("/completion/label").and_then(|v| v.as_str()),
        Some("Tuntas")
    );
    let grade_id = str_field(&first, "gradeId");

    // Same key with a failing test score: one row, updated in place.
    let mut second_params = key.clone();
    second_params["semester"] = json!("odd");
    second_params["record"] = json!({
        "assignmentScores": ["80", "90,5"],
        "testScore": 60,
        "midtermScore": 88,
        "finalScore": 90,
        "attendancePercent": 100
    });
    let second = request_ok(&mut stdin, &mut reader, "4", "grades.save", second_params);
    assert_eq!(second.get("created").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(str_field(&second, "gradeId"), grade_id);
    assert_eq!(
        second.pointer("/completion/label").and_then(|v| v.as_str()),
        Some("Belum Tuntas")
    );
    let failing: Vec<String> = second
        .pointer("/completion/failingComponents")
        .and_then(|v| v.as_array())
        .expect("failingComponents")
        .iter()
        .filter_map(|c| c.get("name").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    assert_eq!(failing, vec!["test".to_string()]);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.list",
        json!({ "subject": "Matematika", "academicYear": "2024/2025" }),
    );
    let rows = listed.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("semester").and_then(|v| v.as_str()), Some("odd"));
    assert_eq!(
        rows[0].get("assignmentScores").cloned(),
        Some(json!([80.0, 90.5]))
    );
    assert_eq!(
        listed.pointer("/summary/incompleteCount").and_then(|v| v.as_u64()),
        Some(1)
    );

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.get",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(fetched.get("studentName").and_then(|v| v.as_str()), Some("Budi Santoso"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.delete",
        json!({ "gradeId": grade_id }),
    );
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "grades.get",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn grades_save_rejects_non_numeric_scores_with_field_name() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _workspace = select_workspace(&mut stdin, &mut reader, "smapna-grades-invalid");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "name": "Ani", "className": "X-2" }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "name": "Pak Joko" }),
    );
    let (code, error) = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "grades.save",
        json!({
            "studentId": str_field(&student, "studentId"),
            "teacherId": str_field(&teacher, "teacherId"),
            "subject": "Biologi",
            "semester": 2,
            "academicYear": "2024/2025",
            "record": { "assignmentScores": [70, "abc"], "testScore": 80 }
        }),
    );
    assert_eq!(code, "invalid_input");
    assert_eq!(
        error.pointer("/details/field").and_then(|v| v.as_str()),
        Some("assignmentScores[1]")
    );

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "grades.save",
        json!({
            "studentId": "missing-student",
            "teacherId": str_field(&teacher, "teacherId"),
            "subject": "Biologi",
            "semester": "even",
            "academicYear": "2024/2025",
            "record": {}
        }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn corrupt_stored_semester_is_reported_not_coerced() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let workspace = select_workspace(&mut stdin, &mut reader, "smapna-grades-corrupt");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "name": "Lestari", "className": "X-4" }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "name": "Ibu Ratna" }),
    );
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.save",
        json!({
            "studentId": str_field(&student, "studentId"),
            "teacherId": str_field(&teacher, "teacherId"),
            "subject": "Geografi",
            "semester": "even",
            "academicYear": "2024/2025",
            "record": { "testScore": 80 }
        }),
    );
    let grade_id = str_field(&saved, "gradeId");

    {
        let conn = rusqlite::Connection::open(workspace.join("smapna.sqlite3")).expect("open db");
        conn.execute("UPDATE grades SET semester = 'summer' WHERE id = ?", [&grade_id])
            .expect("corrupt semester");
    }

    let (code, error) = request_err(&mut stdin, &mut reader, "4", "grades.list", json!({}));
    assert_eq!(code, "db_query_failed");
    assert_eq!(
        error.pointer("/details/gradeId").and_then(|v| v.as_str()),
        Some(grade_id.as_str())
    );
}
