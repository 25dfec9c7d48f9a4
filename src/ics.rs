//! iCalendar interchange: export of a professor's events, tolerant import
//! of external feeds, and the per-professor sync feed on disk.

use crate::calendar::{map_event_type, EventType};
use crate::error::EngineError;
use chrono::{NaiveDate, NaiveDateTime};
use icalendar::parser::{read_calendar, unfold, Component as IcsComponent, Property as IcsProperty};
use icalendar::{Calendar, Component, EventLike, Property};
use std::path::{Path, PathBuf};

const ICS_DT_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone)]
pub struct ExportEvent {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub event_type: EventType,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct Organizer {
    pub name: String,
    pub email: String,
}

/// Serialize events into one VCALENDAR, one VEVENT per event. Start/end are
/// written verbatim as floating local timestamps.
pub fn export_calendar(events: &[ExportEvent], organizer: &Organizer) -> String {
    let mut cal = Calendar::new();

    for event in events {
        let mut vevent = icalendar::Event::new();
        vevent.uid(&event.id);
        vevent.summary(&event.title);
        vevent.add_property("DTSTART", event.start.format(ICS_DT_FORMAT).to_string());
        vevent.add_property("DTEND", event.end.format(ICS_DT_FORMAT).to_string());

        if let Some(ref desc) = event.description {
            vevent.description(desc);
        }
        if let Some(ref loc) = event.location {
            vevent.location(loc);
        }

        vevent.add_property("STATUS", "CONFIRMED");
        vevent.add_property("CATEGORIES", event.event_type.as_str());

        let mut prop = Property::new("ORGANIZER", format!("mailto:{}", organizer.email));
        prop.add_parameter("CN", &organizer.name);
        vevent.append_property(prop);

        cal.push(vevent.done());
    }

    cal.done().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedEvent {
    pub title: String,
    pub description: Option<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub location: Option<String>,
    pub event_type: EventType,
    pub is_recurring: bool,
    pub external_id: Option<String>,
}

/// Parse an iCalendar feed. Only VEVENT components are considered; each is
/// parsed independently, so one malformed block never aborts the batch.
pub fn import_calendar(ics_text: &str) -> Result<Vec<ImportedEvent>, EngineError> {
    let unfolded = unfold(ics_text);
    let calendar =
        read_calendar(&unfolded).map_err(|e| EngineError::new("ics_parse_failed", e))?;

    Ok(calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .filter_map(parse_vevent)
        .collect())
}

fn parse_vevent(vevent: &IcsComponent) -> Option<ImportedEvent> {
    let start = parse_dt_prop(vevent.find_prop("DTSTART")?)?;
    let end = parse_dt_prop(vevent.find_prop("DTEND")?)?;
    if end <= start {
        return None;
    }

    let title = vevent
        .find_prop("SUMMARY")
        .map(|p| p.val.to_string())
        .unwrap_or_else(|| "(No title)".to_string());
    let description = vevent.find_prop("DESCRIPTION").map(|p| p.val.to_string());
    let location = vevent.find_prop("LOCATION").map(|p| p.val.to_string());
    let external_id = vevent.find_prop("UID").map(|p| p.val.to_string());
    let is_recurring = vevent.find_prop("RRULE").is_some();

    let category = vevent
        .find_prop("CATEGORIES")
        .and_then(|p| p.val.as_ref().split(',').next().map(str::trim).map(String::from))
        .unwrap_or_else(|| "other".to_string());
    let event_type = map_event_type(&category);

    Some(ImportedEvent {
        title,
        description,
        start,
        end,
        location,
        event_type,
        is_recurring,
        external_id,
    })
}

/// DTSTART/DTEND value to a local datetime. UTC markers are dropped (the
/// internal representation is floating local) and VALUE=DATE becomes
/// midnight of that day.
fn parse_dt_prop(prop: &IcsProperty) -> Option<NaiveDateTime> {
    let is_date = prop
        .params
        .iter()
        .any(|p| p.key == "VALUE" && p.val.as_ref().map(|v| v.as_ref()) == Some("DATE"));

    let raw = prop.val.as_ref().trim();
    if is_date {
        return NaiveDate::parse_from_str(raw, "%Y%m%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0));
    }
    let raw = raw.strip_suffix('Z').unwrap_or(raw);
    NaiveDateTime::parse_from_str(raw, ICS_DT_FORMAT).ok()
}

/// Per-professor public feed writer. An injected collaborator with explicit
/// dependencies, configured from the workspace `sync.calendar` settings.
#[derive(Debug, Clone)]
pub struct SyncService {
    pub export_dir: PathBuf,
    pub base_url: String,
}

pub const DEFAULT_EXPORT_DIR: &str = "ics";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/calendar";

impl SyncService {
    pub fn from_settings(workspace: &Path, settings: Option<&serde_json::Value>) -> Self {
        let section = settings.and_then(|v| v.as_object());
        let dir_name = section
            .and_then(|o| o.get("exportDirName"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_EXPORT_DIR);
        let base_url = section
            .and_then(|o| o.get("baseUrl"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_BASE_URL);
        SyncService {
            export_dir: workspace.join(dir_name),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn write_feed(&self, professor_id: &str, ics: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.export_dir)?;
        let path = self.export_dir.join(format!("{}.ics", professor_id));
        std::fs::write(&path, ics)?;
        Ok(path)
    }

    pub fn feed_url(&self, professor_id: &str) -> String {
        format!("{}/{}.ics", self.base_url, professor_id)
    }
}
