use crate::calendar::{validate_class_schedule, EnrollmentStatus};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{
    db_conn, is_unique_violation, now_ts, opt_bool, opt_i64, opt_string, required_i64,
    required_str, required_str_list,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const SEMESTERS: &[&str] = &["Fall", "Spring", "Summer", "Winter"];

fn validate_semester(raw: &str) -> Option<String> {
    SEMESTERS
        .iter()
        .find(|s| s.eq_ignore_ascii_case(raw))
        .map(|s| s.to_string())
}

fn class_row_json(row: &rusqlite::Row<'_>) -> Result<serde_json::Value, rusqlite::Error> {
    let id: String = row.get(0)?;
    let professor_id: String = row.get(1)?;
    let name: String = row.get(2)?;
    let course_code: String = row.get(3)?;
    let semester: String = row.get(4)?;
    let year: i64 = row.get(5)?;
    let credits: Option<i64> = row.get(6)?;
    let schedule_days: Option<String> = row.get(7)?;
    let schedule_start: Option<String> = row.get(8)?;
    let schedule_end: Option<String> = row.get(9)?;
    let location: Option<String> = row.get(10)?;
    let max_enrollment: i64 = row.get(11)?;
    let syllabus: Option<String> = row.get(12)?;
    let is_active: i64 = row.get(13)?;
    let current_enrollment: i64 = row.get(14)?;

    let days: Vec<String> = schedule_days
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    Ok(json!({
        "id": id,
        "professorId": professor_id,
        "name": name,
        "courseCode": course_code,
        "semester": semester,
        "year": year,
        "credits": credits,
        "schedule": {
            "days": days,
            "startTime": schedule_start,
            "endTime": schedule_end,
            "location": location
        },
        "maxEnrollment": max_enrollment,
        "syllabus": syllabus,
        "isActive": is_active != 0,
        "currentEnrollment": current_enrollment,
        "availableSpots": max_enrollment - current_enrollment
    }))
}

const CLASS_SELECT: &str = "SELECT
   c.id, c.professor_id, c.name, c.course_code, c.semester, c.year, c.credits,
   c.schedule_days, c.schedule_start, c.schedule_end, c.location,
   c.max_enrollment, c.syllabus, c.is_active,
   (SELECT COUNT(*) FROM enrollments e
      WHERE e.class_id = c.id AND e.status = 'enrolled') AS current_enrollment
 FROM classes c";

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let professor_id = match required_str(req, "professorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let course_code = match required_str(req, "courseCode") {
        Ok(v) => v.to_ascii_uppercase(),
        Err(resp) => return resp,
    };
    let semester = match required_str(req, "semester") {
        Ok(v) => match validate_semester(&v) {
            Some(s) => s,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "semester must be one of Fall, Spring, Summer, Winter",
                    None,
                )
            }
        },
        Err(resp) => return resp,
    };
    let year = match required_i64(req, "year") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let credits = match opt_i64(req, "credits") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let schedule_days = match req.params.get("scheduleDays") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(_) => match required_str_list(req, "scheduleDays") {
            Ok(days) => Some(days.join(",")),
            Err(resp) => return resp,
        },
    };
    let schedule_start = match opt_string(req, "scheduleStart") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let schedule_end = match opt_string(req, "scheduleEnd") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let location = match opt_string(req, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let max_enrollment = match opt_i64(req, "maxEnrollment") {
        Ok(v) => v.unwrap_or(30),
        Err(resp) => return resp,
    };
    let syllabus = match opt_string(req, "syllabus") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if max_enrollment <= 0 {
        return err(&req.id, "bad_params", "maxEnrollment must be positive", None);
    }

    if let (Some(start), Some(end)) = (schedule_start.as_deref(), schedule_end.as_deref()) {
        if let Err(e) = validate_class_schedule(start, end) {
            return engine_err(&req.id, e);
        }
    } else if schedule_start.is_some() != schedule_end.is_some() {
        return err(
            &req.id,
            "bad_params",
            "scheduleStart and scheduleEnd must be given together",
            None,
        );
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

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, professor_id, name, course_code, semester, year, credits,
                             schedule_days, schedule_start, schedule_end, location,
                             max_enrollment, syllabus, is_active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        rusqlite::params![
            &class_id,
            &professor_id,
            &name,
            &course_code,
            &semester,
            year,
            credits,
            &schedule_days,
            &schedule_start,
            &schedule_end,
            &location,
            max_enrollment,
            &syllabus,
        ],
    ) {
        if is_unique_violation(&e) {
            return err(
                &req.id,
                "duplicate",
                "a class with that course code already exists for this semester",
                None,
            );
        }
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "classId": class_id, "courseCode": course_code }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let professor_id = match opt_string(req, "professorId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let include_inactive = match opt_bool(req, "includeInactive", false) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut sql = CLASS_SELECT.to_string();
    let mut clauses: Vec<&str> = Vec::new();
    if !include_inactive {
        clauses.push("c.is_active = 1");
    }
    if professor_id.is_some() {
        clauses.push("c.professor_id = ?");
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY c.year DESC, c.semester, c.course_code");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = if let Some(pid) = professor_id {
        stmt.query_map([pid], class_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        stmt.query_map([], class_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    };

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let sql = format!("{} WHERE c.id = ?", CLASS_SELECT);
    let class = match conn.query_row(&sql, [&class_id], class_row_json).optional() {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut roster_stmt = match conn.prepare(
        "SELECT e.student_id, s.last_name, s.first_name, e.status, e.enrolled_at
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.class_id = ?
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster = roster_stmt
        .query_map([&class_id], |row| {
            let student_id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let status: String = row.get(3)?;
            let enrolled_at: String = row.get(4)?;
            Ok(json!({
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "status": status,
                "enrolledAt": enrolled_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let roster = match roster {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut ann_stmt = match conn.prepare(
        "SELECT id, title, body, posted_at
         FROM class_announcements
         WHERE class_id = ?
         ORDER BY posted_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let announcements = ann_stmt
        .query_map([&class_id], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let body: String = row.get(2)?;
            let posted_at: String = row.get(3)?;
            Ok(json!({
                "id": id,
                "title": title,
                "body": body,
                "postedAt": posted_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let announcements = match announcements {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "class": class,
            "roster": roster,
            "announcements": announcements
        }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let existing: Option<(Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT schedule_start, schedule_end FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((current_start, current_end)) = existing else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let name = match opt_string(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let credits = match opt_i64(req, "credits") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let schedule_days = match req.params.get("scheduleDays") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(_) => match required_str_list(req, "scheduleDays") {
            Ok(days) => Some(days.join(",")),
            Err(resp) => return resp,
        },
    };
    let schedule_start = match opt_string(req, "scheduleStart") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let schedule_end = match opt_string(req, "scheduleEnd") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let location = match opt_string(req, "location") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let max_enrollment = match opt_i64(req, "maxEnrollment") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let syllabus = match opt_string(req, "syllabus") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Some(m) = max_enrollment {
        if m <= 0 {
            return err(&req.id, "bad_params", "maxEnrollment must be positive", None);
        }
    }

    // Validate the schedule the row will end up with, mixing new and kept values.
    let effective_start = schedule_start.clone().or(current_start);
    let effective_end = schedule_end.clone().or(current_end);
    if let (Some(start), Some(end)) = (effective_start.as_deref(), effective_end.as_deref()) {
        if let Err(e) = validate_class_schedule(start, end) {
            return engine_err(&req.id, e);
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE classes SET
           name = COALESCE(?, name),
           credits = COALESCE(?, credits),
           schedule_days = COALESCE(?, schedule_days),
           schedule_start = COALESCE(?, schedule_start),
           schedule_end = COALESCE(?, schedule_end),
           location = COALESCE(?, location),
           max_enrollment = COALESCE(?, max_enrollment),
           syllabus = COALESCE(?, syllabus)
         WHERE id = ?",
        rusqlite::params![
            &name,
            credits,
            &schedule_days,
            &schedule_start,
            &schedule_end,
            &location,
            max_enrollment,
            &syllabus,
            &class_id,
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "classId": class_id }))
}

// Classes are never hard-deleted; grades and enrollments keep their history.
fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let updated = match conn.execute(
        "UPDATE classes SET is_active = 0 WHERE id = ?",
        [&class_id],
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "class not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_announce(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = match required_str(req, "body") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let announcement_id = Uuid::new_v4().to_string();
    let posted_at = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO class_announcements(id, class_id, title, body, posted_at)
         VALUES(?, ?, ?, ?, ?)",
        (&announcement_id, &class_id, &title, &body, &posted_at),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "announcementId": announcement_id, "postedAt": posted_at }),
    )
}

fn handle_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let class_row: Option<(i64, i64)> = match conn
        .query_row(
            "SELECT is_active, max_enrollment FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((is_active, max_enrollment)) = class_row else {
        return err(&req.id, "not_found", "class not found", None);
    };
    if is_active == 0 {
        return err(&req.id, "conflict", "class is no longer active", None);
    }

    let student_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let current_enrollment: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE class_id = ? AND status = 'enrolled'",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if current_enrollment >= max_enrollment {
        return err(&req.id, "conflict", "class is full", None);
    }

    let existing_status: Option<String> = match conn
        .query_row(
            "SELECT status FROM enrollments WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match existing_status.as_deref().and_then(EnrollmentStatus::parse) {
        None if existing_status.is_some() => {
            return err(&req.id, "db_query_failed", "corrupt enrollment status", None)
        }
        None => {
            let enrolled_at = now_ts();
            if let Err(e) = conn.execute(
                "INSERT INTO enrollments(class_id, student_id, status, enrolled_at)
                 VALUES(?, ?, 'enrolled', ?)",
                (&class_id, &student_id, &enrolled_at),
            ) {
                if is_unique_violation(&e) {
                    return err(&req.id, "duplicate", "student is already enrolled", None);
                }
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
        Some(EnrollmentStatus::Enrolled) => {
            return err(&req.id, "duplicate", "student is already enrolled", None)
        }
        Some(current) => {
            if !current.can_transition_to(EnrollmentStatus::Enrolled) {
                return err(
                    &req.id,
                    "invalid_transition",
                    format!("cannot re-enroll from status {}", current.as_str()),
                    None,
                );
            }
            if let Err(e) = conn.execute(
                "UPDATE enrollments SET status = 'enrolled', enrolled_at = ?
                 WHERE class_id = ? AND student_id = ?",
                (now_ts(), &class_id, &student_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "studentId": student_id,
            "status": "enrolled"
        }),
    )
}

fn handle_set_enrollment_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let status_raw = match required_str(req, "status") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(next) = EnrollmentStatus::parse(&status_raw) else {
        return err(
            &req.id,
            "bad_params",
            "status must be one of enrolled, dropped, completed",
            None,
        );
    };

    let current_raw: Option<String> = match conn
        .query_row(
            "SELECT status FROM enrollments WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current_raw) = current_raw else {
        return err(&req.id, "not_found", "enrollment not found", None);
    };
    let Some(current) = EnrollmentStatus::parse(&current_raw) else {
        return err(&req.id, "db_query_failed", "corrupt enrollment status", None);
    };

    if !current.can_transition_to(next) {
        return err(
            &req.id,
            "invalid_transition",
            format!(
                "cannot move enrollment from {} to {}",
                current.as_str(),
                next.as_str()
            ),
            None,
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE enrollments SET status = ? WHERE class_id = ? AND student_id = ?",
        (next.as_str(), &class_id, &student_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "studentId": student_id,
            "status": next.as_str()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_create(state, req)),
        "classes.list" => Some(handle_list(state, req)),
        "classes.open" => Some(handle_open(state, req)),
        "classes.update" => Some(handle_update(state, req)),
        "classes.delete" => Some(handle_delete(state, req)),
        "classes.announce" => Some(handle_announce(state, req)),
        "classes.enroll" => Some(handle_enroll(state, req)),
        "classes.setEnrollmentStatus" => Some(handle_set_enrollment_status(state, req)),
        _ => None,
    }
}
