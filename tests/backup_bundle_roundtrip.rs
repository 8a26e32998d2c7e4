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

fn class_names(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) -> Vec<String> {
    let res = request_ok(stdin, reader, id, "classes.list", json!({}));
    res["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .filter_map(|c| c["name"].as_str().map(|s| s.to_string()))
        .collect()
}

#[test]
fn bundle_export_then_import_restores_workspace() {
    let workspace = temp_dir("resultsd-backup-src");
    let bundle_dir = temp_dir("resultsd-backup-out");
    let bundle_path = bundle_dir.join("workspace.resultsd.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Primary 5" }),
    );

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(export["bundleFormat"], "resultsd-workspace-v1");
    assert_eq!(export["dbSha256"].as_str().map(|s| s.len()), Some(64));
    assert!(bundle_path.is_file());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "name": "Primary 6" }),
    );
    assert_eq!(class_names(&mut stdin, &mut reader, "5").len(), 2);

    let import = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(import["dbSha256"], export["dbSha256"]);
    assert_eq!(
        class_names(&mut stdin, &mut reader, "7"),
        vec!["Primary 5".to_string()]
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(bundle_dir);
}

#[test]
fn tampered_bundle_is_rejected_and_workspace_kept() {
    let workspace = temp_dir("resultsd-backup-tamper");
    let bundle_dir = temp_dir("resultsd-backup-tamper-out");
    let bundle_path = bundle_dir.join("good.zip");
    let tampered_path = bundle_dir.join("tampered.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "JSS 3B" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );

    // Rewrite the bundle with a manifest whose digest no longer matches.
    {
        let mut archive =
            zip::ZipArchive::new(std::fs::File::open(&bundle_path).expect("open bundle"))
                .expect("read bundle");
        let mut manifest_text = String::new();
        std::io::Read::read_to_string(
            &mut archive.by_name("manifest.json").expect("manifest"),
            &mut manifest_text,
        )
        .expect("read manifest");
        let mut manifest: serde_json::Value =
            serde_json::from_str(&manifest_text).expect("manifest json");
        manifest["db"]["sha256"] = json!("0".repeat(64));
        let mut db_bytes = Vec::new();
        std::io::Read::read_to_end(
            &mut archive.by_name("db/resultsd.sqlite3").expect("db entry"),
            &mut db_bytes,
        )
        .expect("read db entry");

        let mut out = zip::ZipWriter::new(
            std::fs::File::create(&tampered_path).expect("create tampered"),
        );
        let opts = zip::write::FileOptions::default();
        out.start_file("manifest.json", opts).expect("start manifest");
        out.write_all(manifest.to_string().as_bytes())
            .expect("write manifest");
        out.start_file("db/resultsd.sqlite3", opts).expect("start db");
        out.write_all(&db_bytes).expect("write db");
        out.finish().expect("finish tampered");
    }

    let rejected = request(
        &mut stdin,
        &mut reader,
        "4",
        "backup.importWorkspaceBundle",
        json!({ "inPath": tampered_path.to_string_lossy() }),
    );
    assert_eq!(error_code(&rejected), Some("backup_import_failed"));

    // The open workspace is still usable after the failed import.
    assert_eq!(
        class_names(&mut stdin, &mut reader, "5"),
        vec!["JSS 3B".to_string()]
    );

    let missing = request(
        &mut stdin,
        &mut reader,
        "6",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_dir.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), Some("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(bundle_dir);
}
