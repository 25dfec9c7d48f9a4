use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, is_unique_violation, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(resp) => return resp,
    };

    let professor_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO professors(id, name, email) VALUES(?, ?, ?)",
        (&professor_id, &name, &email),
    ) {
        if is_unique_violation(&e) {
            return err(
                &req.id,
                "duplicate",
                "a professor with that email already exists",
                None,
            );
        }
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "professorId": professor_id, "name": name, "email": email }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           p.id,
           p.name,
           p.email,
           (SELECT COUNT(*) FROM classes c WHERE c.professor_id = p.id AND c.is_active = 1) AS class_count
         FROM professors p
         ORDER BY p.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let email: String = row.get(2)?;
            let class_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "email": email,
                "classCount": class_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(professors) => ok(&req.id, json!({ "professors": professors })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "professors.create" => Some(handle_create(state, req)),
        "professors.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
