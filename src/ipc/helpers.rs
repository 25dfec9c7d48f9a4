use crate::calendar::format_datetime;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::Value as JsonValue;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Mutable handle for operations that open a transaction.
pub fn db_mut<'a>(
    state: &'a mut AppState,
    req: &Request,
) -> Result<&'a mut Connection, serde_json::Value> {
    state
        .db
        .as_mut()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("missing or non-numeric {}", key),
                None,
            )
        })
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("missing or non-integer {}", key),
                None,
            )
        })
}

pub fn opt_string(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| {
                    err(
                        &req.id,
                        "bad_params",
                        format!("{} must be string or null", key),
                        None,
                    )
                })?
                .trim()
                .to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

pub fn opt_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a number or null", key),
                None,
            )
        }),
    }
}

pub fn opt_i64(req: &Request, key: &str) -> Result<Option<i64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be an integer or null", key),
                None,
            )
        }),
    }
}

pub fn opt_bool(req: &Request, key: &str, default: bool) -> Result<bool, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v.as_bool().ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be boolean", key),
                None,
            )
        }),
    }
}

pub fn required_str_list(req: &Request, key: &str) -> Result<Vec<String>, serde_json::Value> {
    let arr = req
        .params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("missing array {}", key),
                None,
            )
        })?;
    arr.iter()
        .map(|v| {
            v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    format!("{} must contain only strings", key),
                    None,
                )
            })
        })
        .collect()
}

pub fn opt_json(req: &Request, key: &str) -> Option<JsonValue> {
    match req.params.get(key) {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(v.clone()),
    }
}

pub fn now_ts() -> String {
    format_datetime(chrono::Utc::now().naive_utc())
}

/// SQLite reports a lost uniqueness race as a constraint violation; surface
/// it as the duplicate condition rather than a generic insert failure.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
