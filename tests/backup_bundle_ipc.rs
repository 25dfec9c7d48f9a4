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
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
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
    let payload = json!({ "id": id, "method": method, "params": params });
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
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok for {}: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result payload")
}

#[test]
fn bundle_roundtrip_restores_data_into_a_fresh_workspace() {
    let workspace_src = temp_dir("gradebook-bundle-src");
    let workspace_dst = temp_dir("gradebook-bundle-dst");
    let out_dir = temp_dir("gradebook-bundle-out");
    let bundle_path = out_dir.join("workspace-backup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace_src.to_string_lossy() }),
    );
    let professor_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "professors.create",
        json!({ "name": "Barbara Liskov", "email": "bliskov@example.edu" }),
    )
    .get("professorId")
    .and_then(|v| v.as_str())
    .expect("professorId")
    .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({
            "professorId": professor_id,
            "name": "Distributed Systems",
            "courseCode": "CS530",
            "semester": "Spring",
            "year": 2026
        }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.exportBackup",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("gradebook-workspace-v1")
    );
    assert!(exported
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .map(|s| s.len() == 64)
        .unwrap_or(false));
    assert!(bundle_path.is_file());

    // Restore into an empty workspace and confirm the data came along.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.select",
        json!({ "path": workspace_dst.to_string_lossy() }),
    );
    let empty = request_ok(&mut stdin, &mut reader, "6", "professors.list", json!({}));
    assert!(empty
        .get("professors")
        .and_then(|v| v.as_array())
        .map(|a| a.is_empty())
        .unwrap_or(false));

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "workspace.importBackup",
        json!({ "inPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        imported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("gradebook-workspace-v1")
    );

    let restored = request_ok(&mut stdin, &mut reader, "8", "professors.list", json!({}));
    let professors = restored
        .get("professors")
        .and_then(|v| v.as_array())
        .expect("professors");
    assert_eq!(professors.len(), 1);
    assert_eq!(
        professors[0].get("email").and_then(|v| v.as_str()),
        Some("bliskov@example.edu")
    );
    let classes = request_ok(&mut stdin, &mut reader, "9", "classes.list", json!({}));
    assert_eq!(
        classes
            .get("classes")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace_src);
    let _ = std::fs::remove_dir_all(workspace_dst);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn import_rejects_garbage_bundles_and_keeps_the_workspace_usable() {
    let workspace = temp_dir("gradebook-bundle-garbage");
    let out_dir = temp_dir("gradebook-bundle-garbage-out");
    let garbage_path = out_dir.join("not-a-bundle.zip");
    std::fs::write(&garbage_path, b"definitely not a zip archive").expect("write garbage");

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
        "professors.create",
        json!({ "name": "Ken Iverson", "email": "ken@example.edu" }),
    );

    let failed = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.importBackup",
        json!({ "inPath": garbage_path.to_string_lossy() }),
    );
    assert_eq!(failed.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        failed
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("import_failed")
    );

    // The previous data is still reachable after the failed import.
    let still_there = request_ok(&mut stdin, &mut reader, "4", "professors.list", json!({}));
    assert_eq!(
        still_there
            .get("professors")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}
