use crate::calendar::{format_datetime, parse_datetime, EventType};
use crate::db;
use crate::ics::{export_calendar, import_calendar, ExportEvent, Organizer, SyncService};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, db_mut, now_ts, opt_json, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn sync_service(
    state: &AppState,
    req: &Request,
) -> Result<SyncService, serde_json::Value> {
    let conn = db_conn(state, req)?;
    let workspace = state
        .workspace
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))?;
    let settings = db::settings_get_json(conn, "sync.calendar")
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(SyncService::from_settings(workspace, settings.as_ref()))
}

fn load_organizer(
    conn: &rusqlite::Connection,
    req: &Request,
    professor_id: &str,
) -> Result<Organizer, serde_json::Value> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT name, email FROM professors WHERE id = ?",
            [professor_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match row {
        Some((name, email)) => Ok(Organizer { name, email }),
        None => Err(err(&req.id, "not_found", "professor not found", None)),
    }
}

fn load_export_events(
    conn: &rusqlite::Connection,
    req: &Request,
    professor_id: &str,
) -> Result<Vec<ExportEvent>, serde_json::Value> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, description, location, event_type, start_at, end_at
             FROM calendar_events
             WHERE professor_id = ? AND status != 'cancelled'
             ORDER BY start_at",
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let rows = stmt
        .query_map([professor_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let description: Option<String> = row.get(2)?;
            let location: Option<String> = row.get(3)?;
            let event_type: String = row.get(4)?;
            let start_at: String = row.get(5)?;
            let end_at: String = row.get(6)?;
            Ok((id, title, description, location, event_type, start_at, end_at))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;

    let mut events = Vec::with_capacity(rows.len());
    for (id, title, description, location, event_type, start_at, end_at) in rows {
        let start = parse_datetime(&start_at).map_err(|e| engine_err(&req.id, e))?;
        let end = parse_datetime(&end_at).map_err(|e| engine_err(&req.id, e))?;
        events.push(ExportEvent {
            id,
            title,
            description,
            location,
            event_type: EventType::parse(&event_type).unwrap_or(EventType::Other),
            start,
            end,
        });
    }
    Ok(events)
}

fn handle_export_ics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let professor_id = match required_str(req, "professorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let svc = match sync_service(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let organizer = match load_organizer(conn, req, &professor_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let events = match load_export_events(conn, req, &professor_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let ics = export_calendar(&events, &organizer);
    let path = match svc.write_feed(&professor_id, &ics) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "io_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "ics": ics,
            "path": path.to_string_lossy(),
            "url": svc.feed_url(&professor_id),
            "eventCount": events.len()
        }),
    )
}

fn handle_import_ics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let professor_id = match required_str(req, "professorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ics_text = match required_str(req, "ics") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = match db_mut(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

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

    let parsed = match import_calendar(&ics_text) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };

    let tx = match conn.transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut imported = 0usize;
    let mut skipped = 0usize;
    for event in &parsed {
        // Re-importing the same feed must not duplicate events.
        if let Some(ext_id) = event.external_id.as_deref() {
            let exists: Option<i64> = match tx
                .query_row(
                    "SELECT 1 FROM calendar_events
                     WHERE professor_id = ? AND external_id = ?",
                    (&professor_id, ext_id),
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if exists.is_some() {
                skipped += 1;
                continue;
            }
        }

        let event_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO calendar_events(id, professor_id, class_id, title, description,
                                         event_type, start_at, end_at, is_all_day, location,
                                         is_virtual, meeting_url, recurrence_rule, priority,
                                         status, color, reminders, is_public, is_external,
                                         external_id, created_at)
             VALUES(?, ?, NULL, ?, ?, ?, ?, ?, 0, ?, 0, NULL, ?, 'medium',
                    'scheduled', NULL, NULL, 0, 1, ?, ?)",
            rusqlite::params![
                &event_id,
                &professor_id,
                &event.title,
                &event.description,
                event.event_type.as_str(),
                format_datetime(event.start),
                format_datetime(event.end),
                &event.location,
                event.is_recurring.then_some("FREQ=WEEKLY"),
                &event.external_id,
                now_ts(),
            ],
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        imported += 1;
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "imported": imported, "skipped": skipped }),
    )
}

fn handle_sync_link(state: &mut AppState, req: &Request) -> serde_json::Value {
    let professor_id = match required_str(req, "professorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let svc = match sync_service(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
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
    if exists.is_none() {
        return err(&req.id, "not_found", "professor not found", None);
    }

    ok(&req.id, json!({ "url": svc.feed_url(&professor_id) }))
}

fn handle_configure(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(settings) = opt_json(req, "settings") else {
        return err(&req.id, "bad_params", "missing params.settings", None);
    };
    if !settings.is_object() {
        return err(&req.id, "bad_params", "settings must be an object", None);
    }

    if let Err(e) = db::settings_set_json(conn, "sync.calendar", &settings) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calendar.exportIcs" => Some(handle_export_ics(state, req)),
        "calendar.importIcs" => Some(handle_import_ics(state, req)),
        "calendar.syncLink" => Some(handle_sync_link(state, req)),
        "calendar.configureSync" => Some(handle_configure(state, req)),
        _ => None,
    }
}
