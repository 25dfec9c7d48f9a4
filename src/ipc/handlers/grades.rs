use crate::calendar::{format_datetime, parse_datetime, EnrollmentStatus};
use crate::grades::{derive_score, mark_lateness, summarize_for_class, summarize_for_student, GradeRow};
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{
    db_conn, is_unique_violation, now_ts, opt_bool, opt_f64, opt_json, opt_string, required_f64,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDateTime;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const ASSIGNMENT_TYPES: &[&str] = &[
    "homework",
    "quiz",
    "exam",
    "project",
    "participation",
    "attendance",
    "midterm",
    "final",
];

fn parse_opt_datetime(
    req: &Request,
    key: &str,
) -> Result<Option<NaiveDateTime>, serde_json::Value> {
    match opt_string(req, key)? {
        None => Ok(None),
        Some(raw) => parse_datetime(&raw)
            .map(Some)
            .map_err(|e| engine_err(&req.id, e)),
    }
}

fn grade_row_json(row: &rusqlite::Row<'_>) -> Result<serde_json::Value, rusqlite::Error> {
    let id: String = row.get(0)?;
    let class_id: String = row.get(1)?;
    let student_id: String = row.get(2)?;
    let assignment_name: String = row.get(3)?;
    let assignment_type: String = row.get(4)?;
    let due_date: Option<String> = row.get(5)?;
    let max_points: f64 = row.get(6)?;
    let weight: Option<f64> = row.get(7)?;
    let points: f64 = row.get(8)?;
    let feedback: Option<String> = row.get(9)?;
    let submitted_at: Option<String> = row.get(10)?;
    let is_late: Option<i64> = row.get(11)?;
    let late_penalty: Option<f64> = row.get(12)?;
    let is_excused: i64 = row.get(13)?;
    let is_extra_credit: i64 = row.get(14)?;
    let rubric: Option<String> = row.get(15)?;
    let created_at: String = row.get(16)?;

    // Percentage and letter are derived on read, never stored.
    let score = derive_score(points, max_points).unwrap_or_else(|_| crate::grades::ScoreParts {
        percentage: 0.0,
        letter_grade: "F".to_string(),
    });
    let rubric_json = rubric
        .as_deref()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());

    Ok(json!({
        "id": id,
        "classId": class_id,
        "studentId": student_id,
        "assignmentName": assignment_name,
        "assignmentType": assignment_type,
        "dueDate": due_date,
        "maxPoints": max_points,
        "weight": weight,
        "points": points,
        "percentage": score.percentage,
        "letterGrade": score.letter_grade,
        "feedback": feedback,
        "submittedAt": submitted_at,
        "isLate": is_late.map(|v| v != 0),
        "latePenalty": late_penalty,
        "isExcused": is_excused != 0,
        "isExtraCredit": is_extra_credit != 0,
        "rubric": rubric_json,
        "createdAt": created_at
    }))
}

const GRADE_SELECT: &str = "SELECT
   id, class_id, student_id, assignment_name, assignment_type, due_date,
   max_points, weight, points, feedback, submitted_at, is_late, late_penalty,
   is_excused, is_extra_credit, rubric, created_at
 FROM grades";

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let assignment_name = match required_str(req, "assignmentName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let assignment_type = match required_str(req, "assignmentType") {
        Ok(v) => {
            let lowered = v.to_ascii_lowercase();
            if !ASSIGNMENT_TYPES.contains(&lowered.as_str()) {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown assignmentType: {}", v),
                    None,
                );
            }
            lowered
        }
        Err(resp) => return resp,
    };
    let points = match required_f64(req, "points") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let max_points = match required_f64(req, "maxPoints") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let weight = match opt_f64(req, "weight") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let feedback = match opt_string(req, "feedback") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let late_penalty = match opt_f64(req, "latePenalty") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let is_excused = match opt_bool(req, "isExcused", false) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let is_extra_credit = match opt_bool(req, "isExtraCredit", false) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let due_date = match parse_opt_datetime(req, "dueDate") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let submitted_at = match parse_opt_datetime(req, "submittedAt") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let rubric = opt_json(req, "rubric");

    // Validates points/maxPoints before anything is written.
    let score = match derive_score(points, max_points) {
        Ok(s) => s,
        Err(e) => return engine_err(&req.id, e),
    };

    let class_row: Option<(String, i64)> = match conn
        .query_row(
            "SELECT professor_id, is_active FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((professor_id, is_active)) = class_row else {
        return err(&req.id, "not_found", "class not found", None);
    };
    if is_active == 0 {
        return err(&req.id, "conflict", "class is no longer active", None);
    }

    let enrollment: Option<String> = match conn
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
    let enrolled = matches!(
        enrollment.as_deref().and_then(EnrollmentStatus::parse),
        Some(EnrollmentStatus::Enrolled)
    );
    if !enrolled {
        return err(
            &req.id,
            "not_enrolled",
            "student is not enrolled in this class",
            None,
        );
    }

    let is_late = mark_lateness(due_date, submitted_at);
    let rubric_text = match rubric.as_ref().map(serde_json::to_string).transpose() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grades(id, professor_id, class_id, student_id, assignment_name,
                            assignment_type, due_date, max_points, weight, points,
                            feedback, submitted_at, is_late, late_penalty,
                            is_excused, is_extra_credit, rubric, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &grade_id,
            &professor_id,
            &class_id,
            &student_id,
            &assignment_name,
            &assignment_type,
            due_date.map(format_datetime),
            max_points,
            weight,
            points,
            &feedback,
            submitted_at.map(format_datetime),
            is_late.map(|b| b as i64),
            late_penalty,
            is_excused as i64,
            is_extra_credit as i64,
            &rubric_text,
            now_ts(),
        ],
    ) {
        if is_unique_violation(&e) {
            return err(
                &req.id,
                "duplicate",
                "a grade for that assignment already exists for this student",
                None,
            );
        }
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "percentage": score.percentage,
            "letterGrade": score.letter_grade,
            "isLate": is_late
        }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Class and student assignments are immutable; only the grading fields move.
    let current: Option<(f64, f64, Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT points, max_points, due_date, submitted_at FROM grades WHERE id = ?",
            [&grade_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((cur_points, cur_max, cur_due, cur_submitted)) = current else {
        return err(&req.id, "not_found", "grade not found", None);
    };

    if req.params.get("classId").is_some() || req.params.get("studentId").is_some() {
        return err(
            &req.id,
            "bad_params",
            "classId and studentId cannot be changed on an existing grade",
            None,
        );
    }

    let points = match opt_f64(req, "points") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let max_points = match opt_f64(req, "maxPoints") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let assignment_name = match opt_string(req, "assignmentName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let assignment_type = match opt_string(req, "assignmentType") {
        Ok(Some(v)) => {
            let lowered = v.to_ascii_lowercase();
            if !ASSIGNMENT_TYPES.contains(&lowered.as_str()) {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown assignmentType: {}", v),
                    None,
                );
            }
            Some(lowered)
        }
        Ok(None) => None,
        Err(resp) => return resp,
    };
    let weight = match opt_f64(req, "weight") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let feedback = match opt_string(req, "feedback") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let late_penalty = match opt_f64(req, "latePenalty") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let is_excused = match req.params.get("isExcused") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_bool() {
            Some(b) => Some(b),
            None => return err(&req.id, "bad_params", "isExcused must be boolean", None),
        },
    };
    let is_extra_credit = match req.params.get("isExtraCredit") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_bool() {
            Some(b) => Some(b),
            None => return err(&req.id, "bad_params", "isExtraCredit must be boolean", None),
        },
    };
    let due_date = match parse_opt_datetime(req, "dueDate") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let submitted_at = match parse_opt_datetime(req, "submittedAt") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let rubric = opt_json(req, "rubric");
    let rubric_text = match rubric.as_ref().map(serde_json::to_string).transpose() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    let effective_points = points.unwrap_or(cur_points);
    let effective_max = max_points.unwrap_or(cur_max);
    let score = match derive_score(effective_points, effective_max) {
        Ok(s) => s,
        Err(e) => return engine_err(&req.id, e),
    };

    // Lateness is re-derived from whichever dates the row ends up with.
    let effective_due = match due_date {
        Some(d) => Some(d),
        None => match cur_due.as_deref().map(parse_datetime).transpose() {
            Ok(v) => v,
            Err(e) => return engine_err(&req.id, e),
        },
    };
    let effective_submitted = match submitted_at {
        Some(d) => Some(d),
        None => match cur_submitted.as_deref().map(parse_datetime).transpose() {
            Ok(v) => v,
            Err(e) => return engine_err(&req.id, e),
        },
    };
    let is_late = mark_lateness(effective_due, effective_submitted);

    if let Err(e) = conn.execute(
        "UPDATE grades SET
           assignment_name = COALESCE(?, assignment_name),
           assignment_type = COALESCE(?, assignment_type),
           due_date = COALESCE(?, due_date),
           max_points = COALESCE(?, max_points),
           weight = COALESCE(?, weight),
           points = COALESCE(?, points),
           feedback = COALESCE(?, feedback),
           submitted_at = COALESCE(?, submitted_at),
           is_late = ?,
           late_penalty = COALESCE(?, late_penalty),
           is_excused = COALESCE(?, is_excused),
           is_extra_credit = COALESCE(?, is_extra_credit),
           rubric = COALESCE(?, rubric)
         WHERE id = ?",
        rusqlite::params![
            &assignment_name,
            &assignment_type,
            due_date.map(format_datetime),
            max_points,
            weight,
            points,
            &feedback,
            submitted_at.map(format_datetime),
            is_late.map(|b| b as i64),
            late_penalty,
            is_excused.map(|b| b as i64),
            is_extra_credit.map(|b| b as i64),
            &rubric_text,
            &grade_id,
        ],
    ) {
        if is_unique_violation(&e) {
            return err(
                &req.id,
                "duplicate",
                "a grade for that assignment already exists for this student",
                None,
            );
        }
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "percentage": score.percentage,
            "letterGrade": score.letter_grade,
            "isLate": is_late
        }),
    )
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let deleted = match conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "grade not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match opt_string(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match opt_string(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut sql = GRADE_SELECT.to_string();
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(cid) = class_id {
        clauses.push("class_id = ?");
        binds.push(cid);
    }
    if let Some(sid) = student_id {
        clauses.push("student_id = ?");
        binds.push(sid);
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at, assignment_name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), grade_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn fetch_grade_rows(
    conn: &rusqlite::Connection,
    where_col: &str,
    id: &str,
) -> Result<Vec<GradeRow>, rusqlite::Error> {
    let sql = format!(
        "SELECT student_id, class_id, points, max_points, is_excused, is_extra_credit
         FROM grades WHERE {} = ?",
        where_col
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([id], |row| {
        Ok(GradeRow {
            student_id: row.get(0)?,
            class_id: row.get(1)?,
            points: row.get(2)?,
            max_points: row.get(3)?,
            is_excused: row.get::<_, i64>(4)? != 0,
            is_extra_credit: row.get::<_, i64>(5)? != 0,
        })
    })?;
    rows.collect()
}

fn handle_class_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let class_name: Option<String> = match conn
        .query_row("SELECT name FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_name) = class_name else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let rows = match fetch_grade_rows(conn, "class_id", &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let summary = summarize_for_class(&rows);

    let per_student = summary
        .per_student
        .iter()
        .map(|standing| {
            let display_name: Option<String> = conn
                .query_row(
                    "SELECT last_name || ', ' || first_name FROM students WHERE id = ?",
                    [&standing.student_id],
                    |r| r.get(0),
                )
                .optional()
                .ok()
                .flatten();
            let mut entry = serde_json::to_value(standing).unwrap_or_else(|_| json!({}));
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("displayName".to_string(), json!(display_name));
            }
            entry
        })
        .collect::<Vec<_>>();

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "className": class_name,
            "perStudent": per_student,
            "statistics": summary.statistics
        }),
    )
}

fn handle_student_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let display_name: Option<String> = match conn
        .query_row(
            "SELECT last_name || ', ' || first_name FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(display_name) = display_name else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let rows = match fetch_grade_rows(conn, "student_id", &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let summary = summarize_for_student(&rows);

    let per_class = summary
        .per_class
        .iter()
        .map(|standing| {
            let class_name: Option<String> = conn
                .query_row(
                    "SELECT name FROM classes WHERE id = ?",
                    [&standing.class_id],
                    |r| r.get(0),
                )
                .optional()
                .ok()
                .flatten();
            let mut entry = serde_json::to_value(standing).unwrap_or_else(|_| json!({}));
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("className".to_string(), json!(class_name));
            }
            entry
        })
        .collect::<Vec<_>>();

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "displayName": display_name,
            "perClass": per_class
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.create" => Some(handle_create(state, req)),
        "grades.update" => Some(handle_update(state, req)),
        "grades.delete" => Some(handle_delete(state, req)),
        "grades.list" => Some(handle_list(state, req)),
        "grades.classSummary" => Some(handle_class_summary(state, req)),
        "grades.studentSummary" => Some(handle_student_summary(state, req)),
        _ => None,
    }
}
