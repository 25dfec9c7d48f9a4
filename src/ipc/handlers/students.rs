use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_bool, opt_string, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_no = match opt_string(req, "studentNo") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let email = match opt_string(req, "email") {
        Ok(v) => v.map(|s| s.to_ascii_lowercase()),
        Err(resp) => return resp,
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, last_name, first_name, student_no, email, active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (&student_id, &last_name, &first_name, &student_no, &email),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let include_inactive = match opt_bool(req, "includeInactive", false) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let sql = if include_inactive {
        "SELECT id, last_name, first_name, student_no, email, active
         FROM students ORDER BY last_name, first_name"
    } else {
        "SELECT id, last_name, first_name, student_no, email, active
         FROM students WHERE active = 1 ORDER BY last_name, first_name"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let student_no: Option<String> = row.get(3)?;
            let email: Option<String> = row.get(4)?;
            let active: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "lastName": last,
                "firstName": first,
                "displayName": format!("{}, {}", last, first),
                "studentNo": student_no,
                "email": email,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let last_name = match opt_string(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first_name = match opt_string(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_no = match opt_string(req, "studentNo") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let email = match opt_string(req, "email") {
        Ok(v) => v.map(|s| s.to_ascii_lowercase()),
        Err(resp) => return resp,
    };
    let active = match req.params.get("active") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_bool() {
            Some(b) => Some(b),
            None => return err(&req.id, "bad_params", "active must be boolean", None),
        },
    };

    if let Err(e) = conn.execute(
        "UPDATE students SET
           last_name = COALESCE(?, last_name),
           first_name = COALESCE(?, first_name),
           student_no = COALESCE(?, student_no),
           email = COALESCE(?, email),
           active = COALESCE(?, active)
         WHERE id = ?",
        (
            &last_name,
            &first_name,
            &student_no,
            &email,
            active.map(|b| b as i64),
            &student_id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

// No cascade exists from students to enrollments/grades/attendance, so the
// boundary refuses deletion while references remain.
fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let references: Result<(i64, i64, i64), rusqlite::Error> = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM enrollments WHERE student_id = ?1),
           (SELECT COUNT(*) FROM grades WHERE student_id = ?1),
           (SELECT COUNT(*) FROM event_attendees WHERE student_id = ?1)",
        [&student_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    );
    let (enrollments, grades, attendances) = match references {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrollments + grades + attendances > 0 {
        return err(
            &req.id,
            "conflict",
            "student is still referenced by enrollments, grades, or events",
            Some(json!({
                "enrollments": enrollments,
                "grades": grades,
                "eventAttendances": attendances
            })),
        );
    }

    let deleted = match conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_create(state, req)),
        "students.list" => Some(handle_list(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
