mod test_support;

use serde_json::json;
use std::io::Write;
use test_support::{request, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn router_handles_unknown_methods_and_missing_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    let (code, _) = request_err(&mut stdin, &mut reader, "2", "grades.teleport", json!({}));
    assert_eq!(code, "not_implemented");

    for (i, method) in [
        "students.list",
        "grades.list",
        "settings.weights.get",
        "calendar.workdays",
        "activity.list",
        "exchange.exportGradesCsv",
        "backup.exportWorkspaceBundle",
    ]
    .iter()
    .enumerate()
    {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("nw{}", i),
            method,
            json!({ "outPath": "/tmp/x" }),
        );
        assert_eq!(
            resp.pointer("/error/code").and_then(|v| v.as_str()),
            Some("no_workspace"),
            "{} without workspace",
            method
        );
    }

    // Engine-only calculation needs no workspace.
    let calc = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "calc.finalGrade",
        json!({
            "record": {
                "assignmentScores": [80, 90],
                "testScore": 85,
                "midtermScore": 88,
                "finalScore": 90,
                "attendancePercent": 100,
                "extracurricularScore": 100
            }
        }),
    );
    assert_eq!(calc.get("finalGrade").and_then(|v| v.as_f64()), Some(94.1));
    assert_eq!(calc.get("average").and_then(|v| v.as_f64()), Some(85.0));

    // Weight overrides are partial and range-checked like stored weights.
    let boosted = request_ok(
        &mut stdin,
        &mut reader,
        "3b",
        "calc.finalGrade",
        json!({
            "weights": { "extracurricularBonusMax": 10 },
            "record": {
                "assignmentScores": [80, 90],
                "testScore": 85,
                "midtermScore": 88,
                "finalScore": 90,
                "attendancePercent": 100,
                "extracurricularScore": 100
            }
        }),
    );
    assert_eq!(boosted.get("finalGrade").and_then(|v| v.as_f64()), Some(99.1));
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "3c",
        "calc.finalGrade",
        json!({ "weights": { "testWeight": -5 }, "record": { "testScore": 80 } }),
    );
    assert_eq!(code, "bad_params");

    // Malformed lines get a bad_json reply and the loop keeps going.
    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    std::io::BufRead::read_line(&mut reader, &mut line).expect("read bad_json reply");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json reply");
    assert_eq!(value.pointer("/error/code").and_then(|v| v.as_str()), Some("bad_json"));

    let workspace = temp_dir("smapna-router-smoke");
    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(
        selected.get("workspacePath").and_then(|v| v.as_str()).map(str::to_string),
        Some(workspace.to_string_lossy().to_string())
    );
    assert!(workspace.join("smapna.sqlite3").is_file());
    let _ = std::fs::remove_dir_all(workspace);
}
