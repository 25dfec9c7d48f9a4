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

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
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
        json!({ "name": "Alan Turing", "email": "alan@example.edu" }),
    )
    .get("professorId")
    .and_then(|v| v.as_str())
    .expect("professorId")
    .to_string()
}

#[test]
fn event_create_validates_range_and_normalizes_all_day() {
    let workspace = temp_dir("gradebook-events-create");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let professor_id = setup_professor(&mut stdin, &mut reader, &workspace);

    let inverted = request(
        &mut stdin,
        &mut reader,
        "1",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Backwards",
            "eventType": "meeting",
            "startAt": "2025-09-08T15:00:00",
            "endAt": "2025-09-08T14:00:00"
        }),
    );
    assert_eq!(error_code(&inverted), "invalid_range");

    let instant = request(
        &mut stdin,
        &mut reader,
        "2",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Zero length",
            "eventType": "meeting",
            "startAt": "2025-09-08T15:00:00",
            "endAt": "2025-09-08T15:00:00"
        }),
    );
    assert_eq!(error_code(&instant), "invalid_range");

    // An all-day event with equal timestamps is fine: normalization runs
    // before the range check.
    let all_day = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Reading Day",
            "eventType": "holiday",
            "startAt": "2025-09-08T14:00:00",
            "endAt": "2025-09-08T14:00:00",
            "isAllDay": true
        }),
    );
    assert_eq!(
        all_day.get("startAt").and_then(|v| v.as_str()),
        Some("2025-09-08T00:00:00.000")
    );
    assert_eq!(
        all_day.get("endAt").and_then(|v| v.as_str()),
        Some("2025-09-08T23:59:59.999")
    );

    let bad_type = request(
        &mut stdin,
        &mut reader,
        "4",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Mystery",
            "eventType": "shindig",
            "startAt": "2025-09-08T14:00:00",
            "endAt": "2025-09-08T15:00:00"
        }),
    );
    assert_eq!(error_code(&bad_type), "bad_params");

    let bad_color = request(
        &mut stdin,
        &mut reader,
        "5",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Colorful",
            "eventType": "meeting",
            "startAt": "2025-09-08T14:00:00",
            "endAt": "2025-09-08T15:00:00",
            "color": "blue"
        }),
    );
    assert_eq!(error_code(&bad_color), "invalid_input");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn event_status_transitions_are_enforced() {
    let workspace = temp_dir("gradebook-events-status");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let professor_id = setup_professor(&mut stdin, &mut reader, &workspace);

    let event_id = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Seminar",
            "eventType": "seminar",
            "startAt": "2025-09-10T10:00:00",
            "endAt": "2025-09-10T11:00:00"
        }),
    )
    .get("eventId")
    .and_then(|v| v.as_str())
    .expect("eventId")
    .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "events.update",
        json!({ "eventId": event_id, "status": "in_progress" }),
    );

    // An in-progress event cannot go back on the schedule.
    let back = request(
        &mut stdin,
        &mut reader,
        "3",
        "events.update",
        json!({ "eventId": event_id, "status": "scheduled" }),
    );
    assert_eq!(error_code(&back), "invalid_transition");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "events.update",
        json!({ "eventId": event_id, "status": "completed" }),
    );
    let reopened = request(
        &mut stdin,
        &mut reader,
        "5",
        "events.update",
        json!({ "eventId": event_id, "status": "postponed" }),
    );
    assert_eq!(error_code(&reopened), "invalid_transition");

    // Postponed events can be rescheduled.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Makeup Lab",
            "eventType": "lab",
            "startAt": "2025-09-11T10:00:00",
            "endAt": "2025-09-11T12:00:00"
        }),
    )
    .get("eventId")
    .and_then(|v| v.as_str())
    .expect("eventId")
    .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "events.update",
        json!({ "eventId": second, "status": "postponed" }),
    );
    let rescheduled = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "events.update",
        json!({ "eventId": second, "status": "scheduled" }),
    );
    assert!(rescheduled.get("eventId").is_some());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn attendee_lifecycle_over_ipc() {
    let workspace = temp_dir("gradebook-events-attendees");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let professor_id = setup_professor(&mut stdin, &mut reader, &workspace);

    let event_id = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Review Session",
            "eventType": "review_session",
            "startAt": "2025-09-12T16:00:00",
            "endAt": "2025-09-12T17:30:00"
        }),
    )
    .get("eventId")
    .and_then(|v| v.as_str())
    .expect("eventId")
    .to_string();

    let s1 = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "lastName": "Early", "firstName": "Eve" }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();
    let s2 = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "lastName": "Field", "firstName": "Finn" }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();

    // Duplicates within one call collapse; everyone starts invited.
    let added = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "events.addAttendees",
        json!({ "eventId": event_id, "studentIds": [s1, s1, s2] }),
    );
    assert_eq!(added.get("added").and_then(|v| v.as_u64()), Some(2));
    let attendees = added
        .get("attendees")
        .and_then(|v| v.as_array())
        .expect("attendees");
    assert_eq!(attendees.len(), 2);
    assert!(attendees
        .iter()
        .all(|a| a.get("status").and_then(|v| v.as_str()) == Some("invited")));

    // Re-inviting is a no-op.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "events.addAttendees",
        json!({ "eventId": event_id, "studentIds": [s1] }),
    );
    assert_eq!(again.get("added").and_then(|v| v.as_u64()), Some(0));

    let accepted = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "events.setAttendeeStatus",
        json!({ "eventId": event_id, "studentId": s1, "status": "accepted" }),
    );
    assert_eq!(
        accepted.get("status").and_then(|v| v.as_str()),
        Some("accepted")
    );

    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "events.setAttendeeStatus",
        json!({ "eventId": event_id, "studentId": "nobody", "status": "declined" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "8",
        "events.setAttendeeStatus",
        json!({ "eventId": event_id, "studentId": s2, "status": "maybe" }),
    );
    assert_eq!(error_code(&bad_status), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn weekly_schedule_buckets_sunday_through_saturday() {
    let workspace = temp_dir("gradebook-events-weekly");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let professor_id = setup_professor(&mut stdin, &mut reader, &workspace);

    // 2025-09-07 is a Sunday; 2025-09-10 is the Wednesday of that week.
    for (i, (title, start, end)) in [
        ("Sunday Prep", "2025-09-07T08:00:00", "2025-09-07T09:00:00"),
        ("Wed Lecture", "2025-09-10T10:00:00", "2025-09-10T11:00:00"),
        ("Next Week", "2025-09-16T10:00:00", "2025-09-16T11:00:00"),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "events.create",
            json!({
                "professorId": professor_id,
                "title": title,
                "eventType": "lecture",
                "startAt": start,
                "endAt": end
            }),
        );
    }

    // weekStart may be any day of the target week.
    let schedule = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "events.weeklySchedule",
        json!({ "professorId": professor_id, "weekStart": "2025-09-10" }),
    );
    assert_eq!(
        schedule.get("weekStart").and_then(|v| v.as_str()),
        Some("2025-09-07")
    );

    let days = schedule.get("days").expect("days");
    let sunday = days
        .get("Sunday")
        .and_then(|v| v.as_array())
        .expect("Sunday");
    assert_eq!(sunday.len(), 1);
    assert_eq!(
        sunday[0].get("title").and_then(|v| v.as_str()),
        Some("Sunday Prep")
    );
    let wednesday = days
        .get("Wednesday")
        .and_then(|v| v.as_array())
        .expect("Wednesday");
    assert_eq!(wednesday.len(), 1);
    for name in ["Monday", "Tuesday", "Thursday", "Friday", "Saturday"] {
        let bucket = days.get(name).and_then(|v| v.as_array()).expect(name);
        assert!(bucket.is_empty(), "{} should be empty", name);
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn event_delete_removes_attendees_too() {
    let workspace = temp_dir("gradebook-events-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let professor_id = setup_professor(&mut stdin, &mut reader, &workspace);

    let event_id = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "events.create",
        json!({
            "professorId": professor_id,
            "title": "Doomed",
            "eventType": "meeting",
            "startAt": "2025-09-09T09:00:00",
            "endAt": "2025-09-09T10:00:00"
        }),
    )
    .get("eventId")
    .and_then(|v| v.as_str())
    .expect("eventId")
    .to_string();

    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "lastName": "Gone", "firstName": "Gil" }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "events.addAttendees",
        json!({ "eventId": event_id, "studentIds": [student_id.clone()] }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "events.delete",
        json!({ "eventId": event_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "5",
        "events.delete",
        json!({ "eventId": event_id }),
    );
    assert_eq!(error_code(&gone), "not_found");

    // Attendance rows no longer block deleting the student.
    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    assert_eq!(removed.get("ok").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
