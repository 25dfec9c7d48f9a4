use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS professors(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            email TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            professor_id TEXT NOT NULL,
            name TEXT NOT NULL,
            course_code TEXT NOT NULL,
            semester TEXT NOT NULL,
            year INTEGER NOT NULL,
            credits INTEGER,
            schedule_days TEXT,
            schedule_start TEXT,
            schedule_end TEXT,
            location TEXT,
            max_enrollment INTEGER NOT NULL DEFAULT 30,
            syllabus TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(professor_id) REFERENCES professors(id),
            UNIQUE(professor_id, course_code, semester, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_professor ON classes(professor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_announcements(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            posted_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_announcements_class ON class_announcements(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            professor_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            assignment_name TEXT NOT NULL,
            assignment_type TEXT NOT NULL,
            due_date TEXT,
            max_points REAL NOT NULL,
            weight REAL,
            points REAL NOT NULL,
            feedback TEXT,
            submitted_at TEXT,
            is_late INTEGER,
            late_penalty REAL,
            is_excused INTEGER NOT NULL DEFAULT 0,
            is_extra_credit INTEGER NOT NULL DEFAULT 0,
            rubric TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(professor_id) REFERENCES professors(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(class_id, student_id, assignment_name)
        )",
        [],
    )?;
    ensure_grades_rubric(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_class ON grades(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_professor ON grades(professor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calendar_events(
            id TEXT PRIMARY KEY,
            professor_id TEXT NOT NULL,
            class_id TEXT,
            title TEXT NOT NULL,
            description TEXT,
            event_type TEXT NOT NULL,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            is_all_day INTEGER NOT NULL DEFAULT 0,
            location TEXT,
            is_virtual INTEGER NOT NULL DEFAULT 0,
            meeting_url TEXT,
            recurrence_rule TEXT,
            priority TEXT NOT NULL DEFAULT 'medium',
            status TEXT NOT NULL DEFAULT 'scheduled',
            color TEXT,
            reminders TEXT,
            is_public INTEGER NOT NULL DEFAULT 0,
            is_external INTEGER NOT NULL DEFAULT 0,
            external_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(professor_id) REFERENCES professors(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_events_external_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calendar_events_professor ON calendar_events(professor_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calendar_events_class ON calendar_events(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calendar_events_start ON calendar_events(start_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS event_attendees(
            event_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'invited',
            PRIMARY KEY(event_id, student_id),
            FOREIGN KEY(event_id) REFERENCES calendar_events(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_event_attendees_student ON event_attendees(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

// Existing workspaces may predate rubric line items on grades.
fn ensure_grades_rubric(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "rubric")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN rubric TEXT", [])?;
    Ok(())
}

fn ensure_events_external_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "calendar_events", "is_external")? {
        conn.execute(
            "ALTER TABLE calendar_events ADD COLUMN is_external INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "calendar_events", "external_id")? {
        conn.execute("ALTER TABLE calendar_events ADD COLUMN external_id TEXT", [])?;
    }
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        None => Ok(None),
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
