use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

struct Fixture {
    class_id: String,
    subjects: Vec<String>,
    students: Vec<String>,
}

const TERM: &str = "1st Term";
const SESSION: &str = "2024/2025";

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let class_id = request_ok(stdin, reader, "c", "classes.create", json!({ "name": "JSS 1C" }))
        ["classId"]
        .as_str()
        .expect("classId")
        .to_string();

    let mut subjects = Vec::new();
    for (code, name) in [("ENG", "English"), ("MTH", "Mathematics")] {
        let res = request_ok(
            stdin,
            reader,
            &format!("sub-{}", code),
            "subjects.create",
            json!({ "code": code, "name": name }),
        );
        subjects.push(res["subjectId"].as_str().expect("subjectId").to_string());
    }

    let mut students = Vec::new();
    for last in ["Abiola", "Balogun", "Chima", "Dike"] {
        let res = request_ok(
            stdin,
            reader,
            &format!("stu-{}", last),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": "Test" }),
        );
        students.push(res["studentId"].as_str().expect("studentId").to_string());
    }

    // ENG totals: 80, 90, 80, none. MTH totals: 60, 70, 60, incomplete.
    let rows_by_subject = [
        json!([
            { "studentId": students[0], "assessment1": 10, "assessment2": 10, "exam": 60 },
            { "studentId": students[1], "assessment1": 10, "assessment2": 10, "exam": 70 },
            { "studentId": students[2], "assessment1": 5, "assessment2": 5, "exam": 70 }
        ]),
        json!([
            { "studentId": students[0], "assessment1": 10, "assessment2": 10, "exam": 40 },
            { "studentId": students[1], "assessment1": 10, "assessment2": 10, "exam": 50 },
            { "studentId": students[2], "assessment1": 5, "assessment2": 5, "exam": 50 },
            { "studentId": students[3], "assessment1": 7 }
        ]),
    ];
    for (subject_id, rows) in subjects.iter().zip(rows_by_subject) {
        let _ = request_ok(
            stdin,
            reader,
            &format!("save-{}", subject_id),
            "results.bulkSave",
            json!({
                "classId": class_id,
                "subjectId": subject_id,
                "term": TERM,
                "session": SESSION,
                "rows": rows
            }),
        );
    }

    Fixture {
        class_id,
        subjects,
        students,
    }
}

#[test]
fn broadsheet_ranks_students_with_shared_positions() {
    let workspace = temp_dir("resultsd-broadsheet");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.broadsheet",
        json!({ "classId": fx.class_id, "term": TERM, "session": SESSION }),
    );
    assert_eq!(sheet["classSize"].as_u64(), Some(4));
    assert_eq!(sheet["rankedCount"].as_u64(), Some(3));

    let subjects = sheet["subjects"].as_array().expect("subjects");
    assert_eq!(subjects[0]["code"], "ENG");
    assert_eq!(subjects[0]["classAverage"].as_i64(), Some(83));
    assert_eq!(subjects[1]["classAverage"].as_i64(), Some(63));

    let rows = sheet["rows"].as_array().expect("rows");
    let positions: Vec<Option<u64>> = rows.iter().map(|r| r["position"].as_u64()).collect();
    assert_eq!(positions, vec![Some(2), Some(1), Some(2), None]);
    assert_eq!(rows[0]["positionLabel"], "2nd");
    assert_eq!(rows[1]["positionLabel"], "1st");
    assert_eq!(rows[1]["summary"]["totalObtained"].as_f64(), Some(160.0));
    assert_eq!(rows[1]["summary"]["average"].as_f64(), Some(80.0));
    assert_eq!(rows[3]["summary"]["subjectsOffered"].as_u64(), Some(1));
    assert_eq!(rows[3]["summary"]["subjectsGraded"].as_u64(), Some(0));
    assert_eq!(rows[3]["cells"][1]["grade"], "");
    assert_eq!(rows[0]["cells"][0]["grade"], "B2");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn report_card_lists_subject_lines_with_class_averages() {
    let workspace = temp_dir("resultsd-report-card");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.reportCard",
        json!({
            "classId": fx.class_id,
            "studentId": fx.students[2],
            "term": TERM,
            "session": SESSION
        }),
    );
    assert_eq!(card["student"]["displayName"], "Chima, Test");
    let lines = card["lines"].as_array().expect("lines");
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["subjectId"], fx.subjects[0].as_str());
    assert_eq!(lines[0]["total"].as_f64(), Some(80.0));
    assert_eq!(lines[0]["grade"], "B2");
    assert_eq!(lines[0]["tier"], "pass-distinction");
    assert_eq!(lines[0]["classAverage"].as_i64(), Some(83));
    assert_eq!(lines[1]["grade"], "C4");
    assert_eq!(lines[1]["visualState"], "warning");
    assert_eq!(card["summary"]["average"].as_f64(), Some(70.0));
    assert_eq!(card["position"].as_u64(), Some(2));
    assert_eq!(card["classSize"].as_u64(), Some(4));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({
            "section": "reports",
            "patch": { "schoolName": "Unity Model College", "showPositions": false }
        }),
    );
    let hidden = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.reportCard",
        json!({
            "classId": fx.class_id,
            "studentId": fx.students[2],
            "term": TERM,
            "session": SESSION
        }),
    );
    assert!(hidden["position"].is_null());
    assert_eq!(hidden["schoolName"], "Unity Model College");
    assert_eq!(hidden["lines"][0]["classAverage"].as_i64(), Some(83));

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "reports.reportCard",
        json!({
            "classId": fx.class_id,
            "studentId": "nobody",
            "term": TERM,
            "session": SESSION
        }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_average_toggle_hides_averages_on_cards_and_broadsheet() {
    let workspace = temp_dir("resultsd-average-toggle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "reports", "patch": { "showClassAverage": false } }),
    );

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.broadsheet",
        json!({ "classId": fx.class_id, "term": TERM, "session": SESSION }),
    );
    let subjects = sheet["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);
    for subject in subjects {
        assert!(subject["classAverage"].is_null(), "average shown: {}", subject);
    }
    assert_eq!(sheet["rows"][1]["position"].as_u64(), Some(1));

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.reportCard",
        json!({
            "classId": fx.class_id,
            "studentId": fx.students[0],
            "term": TERM,
            "session": SESSION
        }),
    );
    let lines = card["lines"].as_array().expect("lines");
    assert_eq!(lines.len(), 2);
    for line in lines {
        assert!(line["classAverage"].is_null(), "average shown: {}", line);
    }
    assert_eq!(card["position"].as_u64(), Some(2));

    // The toggle only affects presentation; the results view keeps its average.
    let averages = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.classAverages",
        json!({ "classId": fx.class_id, "term": TERM, "session": SESSION }),
    );
    assert_eq!(averages["subjects"][0]["classAverage"].as_i64(), Some(83));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
