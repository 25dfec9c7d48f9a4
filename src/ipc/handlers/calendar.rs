use crate::calendar::{
    add_attendees, format_datetime, normalize_all_day, normalize_week_start, parse_date,
    parse_datetime, set_attendee_status, validate_color, validate_time_range, weekly_schedule,
    Attendee, AttendeeStatus, EventStatus, EventType, Priority, DAY_NAMES,
};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{
    db_conn, db_mut, now_ts, opt_bool, opt_string, required_str, required_str_list,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn event_row_json(row: &rusqlite::Row<'_>) -> Result<serde_json::Value, rusqlite::Error> {
    let id: String = row.get(0)?;
    let professor_id: String = row.get(1)?;
    let class_id: Option<String> = row.get(2)?;
    let title: String = row.get(3)?;
    let description: Option<String> = row.get(4)?;
    let event_type: String = row.get(5)?;
    let start_at: String = row.get(6)?;
    let end_at: String = row.get(7)?;
    let is_all_day: i64 = row.get(8)?;
    let location: Option<String> = row.get(9)?;
    let is_virtual: i64 = row.get(10)?;
    let meeting_url: Option<String> = row.get(11)?;
    let recurrence_rule: Option<String> = row.get(12)?;
    let priority: String = row.get(13)?;
    let status: String = row.get(14)?;
    let color: Option<String> = row.get(15)?;
    let reminders: Option<String> = row.get(16)?;
    let is_public: i64 = row.get(17)?;
    let is_external: i64 = row.get(18)?;
    let external_id: Option<String> = row.get(19)?;
    let created_at: String = row.get(20)?;

    let reminders_json = reminders
        .as_deref()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());

    Ok(json!({
        "id": id,
        "professorId": professor_id,
        "classId": class_id,
        "title": title,
        "description": description,
        "eventType": event_type,
        "startAt": start_at,
        "endAt": end_at,
        "isAllDay": is_all_day != 0,
        "location": location,
        "isVirtual": is_virtual != 0,
        "meetingUrl": meeting_url,
        "recurrenceRule": recurrence_rule,
        "priority": priority,
        "status": status,
        "color": color,
        "reminders": reminders_json,
        "isPublic": is_public != 0,
        "isExternal": is_external != 0,
        "externalId": external_id,
        "createdAt": created_at
    }))
}

const EVENT_SELECT: &str = "SELECT
   id, professor_id, class_id, title, description, event_type, start_at, end_at,
   is_all_day, location, is_virtual, meeting_url, recurrence_rule, priority,
   status, color, reminders, is_public, is_external, external_id, created_at
 FROM calendar_events";

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let professor_id = match required_str(req, "professorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let event_type = match required_str(req, "eventType") {
        Ok(v) => match EventType::parse(&v) {
            Some(t) => t,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown eventType: {}", v),
                    None,
                )
            }
        },
        Err(resp) => return resp,
    };
    let start_raw = match required_str(req, "startAt") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let end_raw = match required_str(req, "endAt") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let is_all_day = match opt_bool(req, "isAllDay", false) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let class_id = match opt_string(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let description = match opt_string(req, "description") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let location = match opt_string(req, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let is_virtual = match opt_bool(req, "isVirtual", false) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let meeting_url = match opt_string(req, "meetingUrl") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let recurrence_rule = match opt_string(req, "recurrenceRule") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let priority = match opt_string(req, "priority") {
        Ok(Some(v)) => match Priority::parse(&v) {
            Some(p) => p,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "priority must be one of low, medium, high",
                    None,
                )
            }
        },
        Ok(None) => Priority::Medium,
        Err(resp) => return resp,
    };
    let color = match opt_string(req, "color") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Some(c) = color.as_deref() {
        if let Err(e) = validate_color(c) {
            return engine_err(&req.id, e);
        }
    }
    let reminders = match req.params.get("reminders") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) if v.is_array() => Some(v.to_string()),
        Some(_) => return err(&req.id, "bad_params", "reminders must be an array", None),
    };
    let is_public = match opt_bool(req, "isPublic", false) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let start = match parse_datetime(&start_raw) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let end = match parse_datetime(&end_raw) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    // All-day normalization runs first so a same-day 14:00/14:00 pair still
    // becomes a valid full-day span.
    let (start, end) = if is_all_day {
        normalize_all_day(start, end)
    } else {
        (start, end)
    };
    if let Err(e) = validate_time_range(start, end) {
        return engine_err(&req.id, e);
    }

    let professor_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM professors WHERE id = ?",
            [&professor_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if professor_exists.is_none() {
        return err(&req.id, "not_found", "professor not found", None);
    }
    if let Some(cid) = class_id.as_deref() {
        let class_exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [cid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if class_exists.is_none() {
            return err(&req.id, "not_found", "class not found", None);
        }
    }

    let event_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO calendar_events(id, professor_id, class_id, title, description,
                                     event_type, start_at, end_at, is_all_day, location,
                                     is_virtual, meeting_url, recurrence_rule, priority,
                                     status, color, reminders, is_public, is_external,
                                     external_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'scheduled', ?, ?, ?, 0, NULL, ?)",
        rusqlite::params![
            &event_id,
            &professor_id,
            &class_id,
            &title,
            &description,
            event_type.as_str(),
            format_datetime(start),
            format_datetime(end),
            is_all_day as i64,
            &location,
            is_virtual as i64,
            &meeting_url,
            &recurrence_rule,
            priority.as_str(),
            &color,
            &reminders,
            is_public as i64,
            now_ts(),
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "eventId": event_id,
            "startAt": format_datetime(start),
            "endAt": format_datetime(end),
            "status": "scheduled"
        }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let event_id = match required_str(req, "eventId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let current: Option<(String, String, String, i64)> = match conn
        .query_row(
            "SELECT start_at, end_at, status, is_all_day FROM calendar_events WHERE id = ?",
            [&event_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((cur_start, cur_end, cur_status, cur_all_day)) = current else {
        return err(&req.id, "not_found", "event not found", None);
    };

    let title = match opt_string(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let description = match opt_string(req, "description") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let event_type = match opt_string(req, "eventType") {
        Ok(Some(v)) => match EventType::parse(&v) {
            Some(t) => Some(t),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown eventType: {}", v),
                    None,
                )
            }
        },
        Ok(None) => None,
        Err(resp) => return resp,
    };
    let start_raw = match opt_string(req, "startAt") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let end_raw = match opt_string(req, "endAt") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let is_all_day = match req.params.get("isAllDay") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_bool() {
            Some(b) => Some(b),
            None => return err(&req.id, "bad_params", "isAllDay must be boolean", None),
        },
    };
    let location = match opt_string(req, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let meeting_url = match opt_string(req, "meetingUrl") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let priority = match opt_string(req, "priority") {
        Ok(Some(v)) => match Priority::parse(&v) {
            Some(p) => Some(p),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "priority must be one of low, medium, high",
                    None,
                )
            }
        },
        Ok(None) => None,
        Err(resp) => return resp,
    };
    let color = match opt_string(req, "color") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Some(c) = color.as_deref() {
        if let Err(e) = validate_color(c) {
            return engine_err(&req.id, e);
        }
    }

    let next_status = match opt_string(req, "status") {
        Ok(Some(v)) => match EventStatus::parse(&v) {
            Some(s) => Some(s),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown status: {}", v),
                    None,
                )
            }
        },
        Ok(None) => None,
        Err(resp) => return resp,
    };
    if let Some(next) = next_status {
        let Some(current_status) = EventStatus::parse(&cur_status) else {
            return err(&req.id, "db_query_failed", "corrupt event status", None);
        };
        if !current_status.can_transition_to(next) {
            return err(
                &req.id,
                "invalid_transition",
                format!(
                    "cannot move event from {} to {}",
                    current_status.as_str(),
                    next.as_str()
                ),
                None,
            );
        }
    }

    // The time window the row ends up with is validated as a whole.
    let start = match start_raw.as_deref().map(parse_datetime).unwrap_or_else(|| parse_datetime(&cur_start)) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let end = match end_raw.as_deref().map(parse_datetime).unwrap_or_else(|| parse_datetime(&cur_end)) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let effective_all_day = is_all_day.unwrap_or(cur_all_day != 0);
    let (start, end) = if effective_all_day {
        normalize_all_day(start, end)
    } else {
        (start, end)
    };
    if let Err(e) = validate_time_range(start, end) {
        return engine_err(&req.id, e);
    }

    if let Err(e) = conn.execute(
        "UPDATE calendar_events SET
           title = COALESCE(?, title),
           description = COALESCE(?, description),
           event_type = COALESCE(?, event_type),
           start_at = ?,
           end_at = ?,
           is_all_day = ?,
           location = COALESCE(?, location),
           meeting_url = COALESCE(?, meeting_url),
           priority = COALESCE(?, priority),
           status = COALESCE(?, status),
           color = COALESCE(?, color)
         WHERE id = ?",
        rusqlite::params![
            &title,
            &description,
            event_type.map(|t| t.as_str()),
            format_datetime(start),
            format_datetime(end),
            effective_all_day as i64,
            &location,
            &meeting_url,
            priority.map(|p| p.as_str()),
            next_status.map(|s| s.as_str()),
            &color,
            &event_id,
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "eventId": event_id,
            "startAt": format_datetime(start),
            "endAt": format_datetime(end)
        }),
    )
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let event_id = match required_str(req, "eventId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = match db_mut(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM event_attendees WHERE event_id = ?",
        [&event_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    let deleted = match tx.execute("DELETE FROM calendar_events WHERE id = ?", [&event_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "event not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let professor_id = match required_str(req, "professorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let class_id = match opt_string(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let from = match opt_string(req, "from") {
        Ok(Some(raw)) => match parse_datetime(&raw) {
            Ok(v) => Some(format_datetime(v)),
            Err(e) => return engine_err(&req.id, e),
        },
        Ok(None) => None,
        Err(resp) => return resp,
    };
    let to = match opt_string(req, "to") {
        Ok(Some(raw)) => match parse_datetime(&raw) {
            Ok(v) => Some(format_datetime(v)),
            Err(e) => return engine_err(&req.id, e),
        },
        Ok(None) => None,
        Err(resp) => return resp,
    };

    let mut sql = format!("{} WHERE professor_id = ?", EVENT_SELECT);
    let mut binds: Vec<String> = vec![professor_id];
    if let Some(cid) = class_id {
        sql.push_str(" AND class_id = ?");
        binds.push(cid);
    }
    if let Some(f) = from {
        sql.push_str(" AND end_at >= ?");
        binds.push(f);
    }
    if let Some(t) = to {
        sql.push_str(" AND start_at <= ?");
        binds.push(t);
    }
    sql.push_str(" ORDER BY start_at");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), event_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(events) => ok(&req.id, json!({ "events": events })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn load_attendees(
    conn: &rusqlite::Connection,
    event_id: &str,
) -> Result<Vec<Attendee>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT student_id, status FROM event_attendees WHERE event_id = ? ORDER BY student_id",
    )?;
    let rows = stmt.query_map([event_id], |row| {
        let student_id: String = row.get(0)?;
        let status_raw: String = row.get(1)?;
        Ok(Attendee {
            student_id,
            status: AttendeeStatus::parse(&status_raw).unwrap_or(AttendeeStatus::Invited),
        })
    })?;
    rows.collect()
}

fn attendees_json(attendees: &[Attendee]) -> serde_json::Value {
    json!(attendees
        .iter()
        .map(|a| json!({ "studentId": a.student_id, "status": a.status.as_str() }))
        .collect::<Vec<_>>())
}

fn handle_add_attendees(state: &mut AppState, req: &Request) -> serde_json::Value {
    let event_id = match required_str(req, "eventId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_ids = match required_str_list(req, "studentIds") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = match db_mut(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let event_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM calendar_events WHERE id = ?",
            [&event_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if event_exists.is_none() {
        return err(&req.id, "not_found", "event not found", None);
    }

    for sid in &student_ids {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [sid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(
                &req.id,
                "not_found",
                format!("student not found: {}", sid),
                None,
            );
        }
    }

    let existing = match load_attendees(conn, &event_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let added = add_attendees(&existing, &student_ids);

    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for attendee in &added {
        if let Err(e) = tx.execute(
            "INSERT INTO event_attendees(event_id, student_id, status) VALUES(?, ?, ?)",
            (&event_id, &attendee.student_id, attendee.status.as_str()),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    let all = match load_attendees(conn, &event_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "added": added.len(),
            "attendees": attendees_json(&all)
        }),
    )
}

fn handle_set_attendee_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let event_id = match required_str(req, "eventId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let status = match required_str(req, "status") {
        Ok(v) => match AttendeeStatus::parse(&v) {
            Some(s) => s,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of invited, accepted, declined, tentative",
                    None,
                )
            }
        },
        Err(resp) => return resp,
    };

    let mut attendees = match load_attendees(conn, &event_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = set_attendee_status(&mut attendees, &student_id, status) {
        return engine_err(&req.id, e);
    }

    if let Err(e) = conn.execute(
        "UPDATE event_attendees SET status = ? WHERE event_id = ? AND student_id = ?",
        (status.as_str(), &event_id, &student_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "eventId": event_id,
            "studentId": student_id,
            "status": status.as_str()
        }),
    )
}

fn handle_weekly_schedule(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let professor_id = match required_str(req, "professorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let week_start_raw = match required_str(req, "weekStart") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let week_start = match parse_date(&week_start_raw) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let sunday = normalize_week_start(week_start);

    let window_start = sunday.and_hms_opt(0, 0, 0).map(format_datetime);
    let window_end = (sunday + chrono::Duration::days(6))
        .and_hms_milli_opt(23, 59, 59, 999)
        .map(format_datetime);
    let (Some(window_start), Some(window_end)) = (window_start, window_end) else {
        return err(&req.id, "invalid_input", "week start out of range", None);
    };

    let sql = format!(
        "{} WHERE professor_id = ? AND start_at >= ? AND start_at <= ? ORDER BY start_at",
        EVENT_SELECT
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(
            rusqlite::params![&professor_id, &window_start, &window_end],
            event_row_json,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let events = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let starts = events
        .iter()
        .filter_map(|e| e.get("startAt").and_then(|v| v.as_str()))
        .map(parse_datetime)
        .collect::<Result<Vec<_>, _>>();
    let starts = match starts {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };

    let buckets = weekly_schedule(&starts, sunday);
    let mut days = serde_json::Map::new();
    for (day_idx, bucket) in buckets.iter().enumerate() {
        let day_events: Vec<serde_json::Value> =
            bucket.iter().map(|i| events[*i].clone()).collect();
        days.insert(DAY_NAMES[day_idx].to_string(), json!(day_events));
    }

    ok(
        &req.id,
        json!({
            "weekStart": sunday.format("%Y-%m-%d").to_string(),
            "days": days
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "events.create" => Some(handle_create(state, req)),
        "events.update" => Some(handle_update(state, req)),
        "events.delete" => Some(handle_delete(state, req)),
        "events.list" => Some(handle_list(state, req)),
        "events.addAttendees" => Some(handle_add_attendees(state, req)),
        "events.setAttendeeStatus" => Some(handle_set_attendee_status(state, req)),
        "events.weeklySchedule" => Some(handle_weekly_schedule(state, req)),
        _ => None,
    }
}
