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

fn setup_professor(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "p1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "p2",
        "professors.create",
        json!({ "name": "Edsger Dijkstra", "email": "ewd@example.edu" }),
    )
    .get("professorId")
    .and_then(|v| v.as_str())
    .expect("professorId")
    .to_string()
}

#[test]
fn export_writes_feed_file_and_skips_cancelled_events() {
    let workspace = temp_dir("gradebook-ics-export");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let professor_id = setup_professor(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Algorithms Lecture",
            "description": "Shortest paths",
            "location": "Hall B",
            "eventType": "lecture",
            "startAt": "2025-09-10T10:00:00",
            "endAt": "2025-09-10T11:00:00"
        }),
    );
    let cancelled = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Cancelled Meeting",
            "eventType": "meeting",
            "startAt": "2025-09-11T10:00:00",
            "endAt": "2025-09-11T11:00:00"
        }),
    )
    .get("eventId")
    .and_then(|v| v.as_str())
    .expect("eventId")
    .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "events.update",
        json!({ "eventId": cancelled, "status": "cancelled" }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calendar.exportIcs",
        json!({ "professorId": professor_id }),
    );
    assert_eq!(exported.get("eventCount").and_then(|v| v.as_u64()), Some(1));
    let ics = exported
        .get("ics")
        .and_then(|v| v.as_str())
        .expect("ics text");
    assert!(ics.contains("BEGIN:VCALENDAR"));
    assert!(ics.contains("SUMMARY:Algorithms Lecture"));
    assert!(!ics.contains("Cancelled Meeting"));
    assert!(ics.contains("mailto:ewd@example.edu"));

    // Feed file lands under the workspace's default ics/ directory.
    let path = exported
        .get("path")
        .and_then(|v| v.as_str())
        .expect("feed path");
    let on_disk = std::fs::read_to_string(path).expect("read feed file");
    assert_eq!(on_disk, ics);
    assert!(path.contains("ics"));

    let link = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "calendar.syncLink",
        json!({ "professorId": professor_id }),
    );
    assert_eq!(
        link.get("url").and_then(|v| v.as_str()),
        Some(format!("http://localhost:8080/calendar/{}.ics", professor_id).as_str())
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn configure_sync_changes_feed_location_and_url() {
    let workspace = temp_dir("gradebook-ics-config");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let professor_id = setup_professor(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "calendar.configureSync",
        json!({
            "settings": {
                "exportDirName": "feeds",
                "baseUrl": "https://school.example.edu/cal/"
            }
        }),
    );

    let link = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "calendar.syncLink",
        json!({ "professorId": professor_id }),
    );
    assert_eq!(
        link.get("url").and_then(|v| v.as_str()),
        Some(format!("https://school.example.edu/cal/{}.ics", professor_id).as_str())
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "calendar.exportIcs",
        json!({ "professorId": professor_id }),
    );
    let path = exported
        .get("path")
        .and_then(|v| v.as_str())
        .expect("feed path");
    assert!(path.contains("feeds"));
    assert!(std::path::Path::new(path).is_file());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn import_maps_types_dedups_on_external_id_and_tolerates_bad_blocks() {
    let workspace = temp_dir("gradebook-ics-import");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let professor_id = setup_professor(&mut stdin, &mut reader, &workspace);

    let ics = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:EXTERNAL\r\n\
BEGIN:VEVENT\r\n\
UID:ext-1\r\n\
SUMMARY:Midterm Exam Review\r\n\
CATEGORIES:Midterm Exam Review\r\n\
DTSTART:20250915T090000\r\n\
DTEND:20250915T110000\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:ext-2\r\n\
SUMMARY:Team Sync\r\n\
CATEGORIES:Team Sync\r\n\
DTSTART:20250916T090000Z\r\n\
DTEND:20250916T093000Z\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:ext-broken\r\n\
SUMMARY:No times here\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "calendar.importIcs",
        json!({ "professorId": professor_id, "ics": ics }),
    );
    assert_eq!(first.get("imported").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(first.get("skipped").and_then(|v| v.as_u64()), Some(0));

    // Re-importing the same feed imports nothing new.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "calendar.importIcs",
        json!({ "professorId": professor_id, "ics": ics }),
    );
    assert_eq!(second.get("imported").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(second.get("skipped").and_then(|v| v.as_u64()), Some(2));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "events.list",
        json!({ "professorId": professor_id }),
    );
    let events = listed
        .get("events")
        .and_then(|v| v.as_array())
        .expect("events");
    assert_eq!(events.len(), 2);

    let review = events
        .iter()
        .find(|e| e.get("title").and_then(|v| v.as_str()) == Some("Midterm Exam Review"))
        .expect("review event");
    assert_eq!(
        review.get("eventType").and_then(|v| v.as_str()),
        Some("exam")
    );
    assert_eq!(
        review.get("isExternal").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        review.get("externalId").and_then(|v| v.as_str()),
        Some("ext-1")
    );

    let sync = events
        .iter()
        .find(|e| e.get("title").and_then(|v| v.as_str()) == Some("Team Sync"))
        .expect("sync event");
    assert_eq!(
        sync.get("eventType").and_then(|v| v.as_str()),
        Some("meeting")
    );
    // UTC suffix drops into floating local time.
    assert_eq!(
        sync.get("startAt").and_then(|v| v.as_str()),
        Some("2025-09-16T09:00:00.000")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
