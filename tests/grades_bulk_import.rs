mod test_support;

use serde_json::json;
use test_support::{request_ok, select_workspace, spawn_sidecar, str_field};

#[test]
fn bulk_import_reports_per_row_outcomes() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _workspace = select_workspace(&mut stdin, &mut reader, "smapna-bulk-import");

    for (i, (name, nis)) in [("Budi", "2001"), ("Citra", "2002"), ("Dewi", "2003")]
        .iter()
        .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "name": name, "nis": nis, "className": "XI-IPA" }),
        );
    }
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "teachers.create",
        json!({ "name": "Ibu Rina" }),
    );
    let teacher_id = str_field(&teacher, "teacherId");

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.bulkImport",
        json!({
            "subject": "Fisika",
            "semester": "genap",
            "academicYear": "2024/2025",
            "teacherId": teacher_id,
            "rows": [
                { "nis": "2001", "assignmentScores": [75, 80], "testScore": 78,
                  "midtermScore": 80, "finalScore": 82, "attendanceDays": 90 },
                { "nis": 2002, "assignmentScores": 70, "testScore": "71,5",
                  "midtermScore": 72, "finalScore": 73, "attendancePercent": 95 },
                { "nis": "2003", "assignmentScores": [80, "n/a"], "testScore": 80 },
                { "nis": "9999", "testScore": 80 }
            ]
        }),
    );
    assert_eq!(result.get("imported").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(result.get("created").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(result.get("rejected").and_then(|v| v.as_u64()), Some(2));

    let errors = result.get("errors").and_then(|v| v.as_array()).expect("errors");
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].get("row").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(errors[0].get("code").and_then(|v| v.as_str()), Some("invalid_input"));
    assert_eq!(
        errors[0].pointer("/details/field").and_then(|v| v.as_str()),
        Some("assignmentScores[1]")
    );
    assert_eq!(errors[1].get("row").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(errors[1].get("code").and_then(|v| v.as_str()), Some("not_found"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.list",
        json!({ "subject": "Fisika", "semester": "even" }),
    );
    let rows = listed.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    let budi = rows
        .iter()
        .find(|r| r.get("nis").and_then(|v| v.as_str()) == Some("2001"))
        .expect("budi row");
    // 90 attended days over the default 90 effective days.
    assert_eq!(budi.get("attendancePercent").and_then(|v| v.as_f64()), Some(100.0));

    // Re-importing an existing key updates instead of inserting.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.bulkImport",
        json!({
            "subject": "Fisika",
            "semester": 2,
            "academicYear": "2024/2025",
            "teacherId": teacher_id,
            "rows": [{ "nis": "2001", "testScore": 90 }]
        }),
    );
    assert_eq!(again.get("imported").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(again.get("updated").and_then(|v| v.as_u64()), Some(1));
}

#[test]
fn bulk_import_rejects_oversized_batches() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _workspace = select_workspace(&mut stdin, &mut reader, "smapna-bulk-limit");
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "teachers.create",
        json!({ "name": "Pak Hadi" }),
    );

    let rows: Vec<serde_json::Value> = (0..2001).map(|i| json!({ "nis": i })).collect();
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.bulkImport",
        json!({
            "subject": "Kimia",
            "semester": "odd",
            "academicYear": "2024/2025",
            "teacherId": str_field(&teacher, "teacherId"),
            "rows": rows
        }),
    );
    assert_eq!(result.get("limitExceeded").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(result.get("imported").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(result.get("rejected").and_then(|v| v.as_u64()), Some(2001));
}

#[test]
fn bulk_import_rejects_scores_outside_the_scale() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _workspace = select_workspace(&mut stdin, &mut reader, "smapna-bulk-range");

    for (i, nis) in ["7001", "7002", "7003"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "name": format!("Siswa {}", nis), "nis": nis, "className": "X-7" }),
        );
    }
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "teachers.create",
        json!({ "name": "Pak Dedi" }),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.bulkImport",
        json!({
            "subject": "Seni Budaya",
            "semester": "odd",
            "academicYear": "2024/2025",
            "teacherId": str_field(&teacher, "teacherId"),
            "rows": [
                { "nis": "7001", "assignmentScores": [150, 300], "testScore": 500 },
                { "nis": "7002", "assignmentScores": [-500], "testScore": -80, "attendanceDays": -30 },
                { "nis": "7003", "assignmentScores": [100], "testScore": 0 }
            ]
        }),
    );
    assert_eq!(result.get("imported").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(result.get("rejected").and_then(|v| v.as_u64()), Some(2));

    let errors = result.get("errors").and_then(|v| v.as_array()).expect("errors");
    assert_eq!(errors[0].get("row").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(errors[0].get("code").and_then(|v| v.as_str()), Some("invalid_input"));
    assert_eq!(
        errors[0].pointer("/details/field").and_then(|v| v.as_str()),
        Some("assignmentScores[0]")
    );
    assert_eq!(errors[1].get("row").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(errors[1].get("code").and_then(|v| v.as_str()), Some("invalid_input"));
    // Attendance is read first, so the negative day count is what gets reported.
    assert_eq!(
        errors[1].pointer("/details/field").and_then(|v| v.as_str()),
        Some("attendanceDays")
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.list",
        json!({ "subject": "Seni Budaya" }),
    );
    let rows = listed.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("nis").and_then(|v| v.as_str()), Some("7003"));
}
