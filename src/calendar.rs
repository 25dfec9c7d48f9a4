use crate::error::EngineError;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

/// Wire format for local (floating) timestamps, millisecond precision.
pub const DT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

pub fn parse_datetime(raw: &str) -> Result<NaiveDateTime, EngineError> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S%.f").map_err(|_| {
        EngineError::invalid_input(format!("invalid datetime: {} (expected ISO local)", raw))
    })
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format(DT_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::invalid_input(format!("invalid date: {} (expected YYYY-MM-DD)", raw)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Class,
    Lecture,
    Exam,
    Quiz,
    AssignmentDue,
    OfficeHours,
    Meeting,
    Conference,
    Workshop,
    Seminar,
    Lab,
    ReviewSession,
    Holiday,
    Break,
    Personal,
    Other,
}

impl EventType {
    pub const ALL: [EventType; 16] = [
        EventType::Class,
        EventType::Lecture,
        EventType::Exam,
        EventType::Quiz,
        EventType::AssignmentDue,
        EventType::OfficeHours,
        EventType::Meeting,
        EventType::Conference,
        EventType::Workshop,
        EventType::Seminar,
        EventType::Lab,
        EventType::ReviewSession,
        EventType::Holiday,
        EventType::Break,
        EventType::Personal,
        EventType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Class => "class",
            EventType::Lecture => "lecture",
            EventType::Exam => "exam",
            EventType::Quiz => "quiz",
            EventType::AssignmentDue => "assignment_due",
            EventType::OfficeHours => "office_hours",
            EventType::Meeting => "meeting",
            EventType::Conference => "conference",
            EventType::Workshop => "workshop",
            EventType::Seminar => "seminar",
            EventType::Lab => "lab",
            EventType::ReviewSession => "review_session",
            EventType::Holiday => "holiday",
            EventType::Break => "break",
            EventType::Personal => "personal",
            EventType::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<EventType> {
        EventType::ALL.into_iter().find(|t| t.as_str() == raw)
    }
}

/// Keyword table for classifying external labels. Order is the tie-break:
/// the first entry whose keyword occurs in the label wins.
const EVENT_TYPE_KEYWORDS: &[(&str, EventType)] = &[
    ("office hours", EventType::OfficeHours),
    ("exam", EventType::Exam),
    ("midterm", EventType::Exam),
    ("final", EventType::Exam),
    ("quiz", EventType::Quiz),
    ("lecture", EventType::Lecture),
    ("lab", EventType::Lab),
    ("assignment", EventType::AssignmentDue),
    ("due", EventType::AssignmentDue),
    ("meeting", EventType::Meeting),
    ("sync", EventType::Meeting),
    ("standup", EventType::Meeting),
    ("conference", EventType::Conference),
    ("workshop", EventType::Workshop),
    ("seminar", EventType::Seminar),
    ("review", EventType::ReviewSession),
    ("class", EventType::Class),
    ("holiday", EventType::Holiday),
    ("break", EventType::Break),
    ("personal", EventType::Personal),
];

/// Case-insensitive substring classification of an external event label.
/// Underscores count as spaces so internal labels round-trip.
pub fn map_event_type(label: &str) -> EventType {
    let needle = label.to_ascii_lowercase().replace('_', " ");
    for (keyword, event_type) in EVENT_TYPE_KEYWORDS {
        if needle.contains(keyword) {
            return *event_type;
        }
    }
    EventType::Other
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Postponed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::InProgress => "in_progress",
            EventStatus::Completed => "completed",
            EventStatus::Cancelled => "cancelled",
            EventStatus::Postponed => "postponed",
        }
    }

    pub fn parse(raw: &str) -> Option<EventStatus> {
        match raw {
            "scheduled" => Some(EventStatus::Scheduled),
            "in_progress" => Some(EventStatus::InProgress),
            "completed" => Some(EventStatus::Completed),
            "cancelled" => Some(EventStatus::Cancelled),
            "postponed" => Some(EventStatus::Postponed),
            _ => None,
        }
    }

    /// Transition graph. Completed and cancelled are terminal; a postponed
    /// event can be put back on the schedule.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            EventStatus::Scheduled => true,
            EventStatus::InProgress => !matches!(next, EventStatus::Scheduled),
            EventStatus::Postponed => {
                matches!(next, EventStatus::Scheduled | EventStatus::Cancelled)
            }
            EventStatus::Completed | EventStatus::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendeeStatus {
    Invited,
    Accepted,
    Declined,
    Tentative,
}

impl AttendeeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendeeStatus::Invited => "invited",
            AttendeeStatus::Accepted => "accepted",
            AttendeeStatus::Declined => "declined",
            AttendeeStatus::Tentative => "tentative",
        }
    }

    pub fn parse(raw: &str) -> Option<AttendeeStatus> {
        match raw {
            "invited" => Some(AttendeeStatus::Invited),
            "accepted" => Some(AttendeeStatus::Accepted),
            "declined" => Some(AttendeeStatus::Declined),
            "tentative" => Some(AttendeeStatus::Tentative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentStatus {
    Enrolled,
    Dropped,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::Dropped => "dropped",
            EnrollmentStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<EnrollmentStatus> {
        match raw {
            "enrolled" => Some(EnrollmentStatus::Enrolled),
            "dropped" => Some(EnrollmentStatus::Dropped),
            "completed" => Some(EnrollmentStatus::Completed),
            _ => None,
        }
    }

    /// A dropped student may re-enroll; a completed enrollment is final.
    pub fn can_transition_to(self, next: EnrollmentStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            EnrollmentStatus::Enrolled => true,
            EnrollmentStatus::Dropped => matches!(next, EnrollmentStatus::Enrolled),
            EnrollmentStatus::Completed => false,
        }
    }
}

pub fn validate_time_range(start: NaiveDateTime, end: NaiveDateTime) -> Result<(), EngineError> {
    if end <= start {
        return Err(EngineError::invalid_range(
            "end must be strictly after start",
        ));
    }
    Ok(())
}

/// All-day events span their full calendar days: start-of-day to
/// 23:59:59.999 of the end's day.
pub fn normalize_all_day(
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> (NaiveDateTime, NaiveDateTime) {
    let norm_start = start.date().and_hms_opt(0, 0, 0).expect("midnight");
    let norm_end = end
        .date()
        .and_hms_milli_opt(23, 59, 59, 999)
        .expect("end of day");
    (norm_start, norm_end)
}

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_hhmm(raw: &str) -> Result<u32, EngineError> {
    let bad = || EngineError::invalid_input(format!("invalid time: {} (expected HH:MM)", raw));
    let (h, m) = raw.trim().split_once(':').ok_or_else(bad)?;
    let hours: u32 = h.parse().map_err(|_| bad())?;
    let minutes: u32 = m.parse().map_err(|_| bad())?;
    if hours > 23 || minutes > 59 {
        return Err(bad());
    }
    Ok(hours * 60 + minutes)
}

pub fn validate_class_schedule(start_hhmm: &str, end_hhmm: &str) -> Result<(), EngineError> {
    let start = parse_hhmm(start_hhmm)?;
    let end = parse_hhmm(end_hhmm)?;
    if end <= start {
        return Err(EngineError::invalid_range(
            "schedule end time must be after start time",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attendee {
    pub student_id: String,
    pub status: AttendeeStatus,
}

/// Compute the attendee entries to add: ids already present are skipped and
/// duplicates within one call collapse. New entries start as invited.
pub fn add_attendees(existing: &[Attendee], student_ids: &[String]) -> Vec<Attendee> {
    let mut added: Vec<Attendee> = Vec::new();
    for id in student_ids {
        let present = existing.iter().any(|a| &a.student_id == id)
            || added.iter().any(|a| &a.student_id == id);
        if !present {
            added.push(Attendee {
                student_id: id.clone(),
                status: AttendeeStatus::Invited,
            });
        }
    }
    added
}

pub fn set_attendee_status(
    attendees: &mut [Attendee],
    student_id: &str,
    status: AttendeeStatus,
) -> Result<(), EngineError> {
    match attendees.iter_mut().find(|a| a.student_id == student_id) {
        Some(attendee) => {
            attendee.status = status;
            Ok(())
        }
        None => Err(EngineError::not_found("attendee not found on event")),
    }
}

pub const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Walk back to the preceding (or same) Sunday.
pub fn normalize_week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(day.weekday().num_days_from_sunday() as i64)
}

/// Bucket event start times into the seven days of the week containing
/// `week_start`. Returns per-day index lists into the input slice; events
/// outside the 7-day window are dropped.
pub fn weekly_schedule(starts: &[NaiveDateTime], week_start: NaiveDate) -> [Vec<usize>; 7] {
    let sunday = normalize_week_start(week_start);
    let window_start = sunday.and_hms_opt(0, 0, 0).expect("midnight");
    let window_end = (sunday + Duration::days(6))
        .and_hms_milli_opt(23, 59, 59, 999)
        .expect("end of day");

    let mut buckets: [Vec<usize>; 7] = Default::default();
    for (idx, start) in starts.iter().enumerate() {
        if *start < window_start || *start > window_end {
            continue;
        }
        let day_idx = start.date().weekday().num_days_from_sunday() as usize;
        buckets[day_idx].push(idx);
    }
    buckets
}

pub fn validate_color(raw: &str) -> Result<(), EngineError> {
    let ok = raw.len() == 7
        && raw.starts_with('#')
        && raw[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !ok {
        return Err(EngineError::invalid_input(format!(
            "invalid color: {} (expected #RRGGBB)",
            raw
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Priority> {
        match raw {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn time_range_rejects_equal_and_inverted() {
        let t = dt(2025, 3, 10, 14, 0);
        assert_eq!(validate_time_range(t, t).unwrap_err().code, "invalid_range");
        assert_eq!(
            validate_time_range(t, t - Duration::minutes(5))
                .unwrap_err()
                .code,
            "invalid_range"
        );
        assert!(validate_time_range(t, t + Duration::milliseconds(1)).is_ok());
    }

    #[test]
    fn all_day_normalizes_to_day_bounds() {
        let (start, end) = normalize_all_day(dt(2025, 3, 10, 14, 22), dt(2025, 3, 10, 16, 0));
        assert_eq!(format_datetime(start), "2025-03-10T00:00:00.000");
        assert_eq!(format_datetime(end), "2025-03-10T23:59:59.999");
    }

    #[test]
    fn all_day_keeps_multi_day_span() {
        let (start, end) = normalize_all_day(dt(2025, 3, 10, 9, 0), dt(2025, 3, 12, 9, 0));
        assert_eq!(start.date(), NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(end.date(), NaiveDate::from_ymd_opt(2025, 3, 12).unwrap());
    }

    #[test]
    fn class_schedule_end_after_start_in_minutes() {
        assert!(validate_class_schedule("09:00", "10:15").is_ok());
        assert_eq!(
            validate_class_schedule("10:15", "10:15").unwrap_err().code,
            "invalid_range"
        );
        assert_eq!(
            validate_class_schedule("10:15", "09:00").unwrap_err().code,
            "invalid_range"
        );
        assert_eq!(
            validate_class_schedule("25:00", "26:00").unwrap_err().code,
            "invalid_input"
        );
        assert_eq!(
            validate_class_schedule("9am", "10am").unwrap_err().code,
            "invalid_input"
        );
    }

    #[test]
    fn add_attendees_is_idempotent_and_collapses_duplicates() {
        let existing = vec![];
        let added = add_attendees(
            &existing,
            &["s1".to_string(), "s1".to_string(), "s2".to_string()],
        );
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|a| a.status == AttendeeStatus::Invited));

        let second = add_attendees(&added, &["s1".to_string()]);
        assert!(second.is_empty());
    }

    #[test]
    fn set_attendee_status_requires_existing_entry() {
        let mut attendees = vec![Attendee {
            student_id: "s1".to_string(),
            status: AttendeeStatus::Invited,
        }];
        set_attendee_status(&mut attendees, "s1", AttendeeStatus::Accepted).expect("set");
        assert_eq!(attendees[0].status, AttendeeStatus::Accepted);

        let missing = set_attendee_status(&mut attendees, "s9", AttendeeStatus::Declined);
        assert_eq!(missing.unwrap_err().code, "not_found");
    }

    #[test]
    fn event_type_keyword_table_order() {
        assert_eq!(map_event_type("Midterm Exam Review"), EventType::Exam);
        assert_eq!(map_event_type("Team Sync"), EventType::Meeting);
        assert_eq!(map_event_type("Potluck"), EventType::Other);
        assert_eq!(map_event_type("OFFICE HOURS"), EventType::OfficeHours);
        assert_eq!(map_event_type("Chem Lab"), EventType::Lab);
    }

    #[test]
    fn event_type_labels_round_trip_through_mapping() {
        for t in EventType::ALL {
            assert_eq!(map_event_type(t.as_str()), t, "label {}", t.as_str());
        }
    }

    #[test]
    fn event_status_transition_graph() {
        use EventStatus::*;
        assert!(Scheduled.can_transition_to(InProgress));
        assert!(Scheduled.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Postponed));
        assert!(!InProgress.can_transition_to(Scheduled));
        assert!(Postponed.can_transition_to(Scheduled));
        assert!(!Completed.can_transition_to(Scheduled));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn enrollment_transition_graph() {
        use EnrollmentStatus::*;
        assert!(Enrolled.can_transition_to(Dropped));
        assert!(Enrolled.can_transition_to(Completed));
        assert!(Dropped.can_transition_to(Enrolled));
        assert!(!Completed.can_transition_to(Enrolled));
    }

    #[test]
    fn week_start_normalizes_back_to_sunday() {
        // 2025-03-12 is a Wednesday.
        let wednesday = NaiveDate::from_ymd_opt(2025, 3, 12).unwrap();
        assert_eq!(
            normalize_week_start(wednesday),
            NaiveDate::from_ymd_opt(2025, 3, 9).unwrap()
        );
        let sunday = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(normalize_week_start(sunday), sunday);
    }

    #[test]
    fn weekly_schedule_buckets_by_local_day() {
        let starts = vec![
            dt(2025, 3, 12, 10, 0), // Wednesday
            dt(2025, 3, 9, 8, 0),   // Sunday
            dt(2025, 3, 20, 10, 0), // outside the window
        ];
        let buckets = weekly_schedule(&starts, NaiveDate::from_ymd_opt(2025, 3, 12).unwrap());
        assert_eq!(buckets[3], vec![0]); // Wednesday
        assert_eq!(buckets[0], vec![1]); // Sunday
        let total: usize = buckets.iter().map(|b| b.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn color_must_be_hex_rgb() {
        assert!(validate_color("#A1b2C3").is_ok());
        assert!(validate_color("A1b2C3").is_err());
        assert!(validate_color("#A1b2C").is_err());
        assert!(validate_color("#A1b2G3").is_err());
    }
}
