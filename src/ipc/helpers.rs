use rusqlite::{Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::err;
use super::types::{AppState, Request};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_TEACHER: &str = "teacher";
pub const ROLE_STUDENT: &str = "student";

/// Verified caller identity, supplied explicitly with every request by
/// the trusted front end. Core operations never infer identity from
/// ambient state.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub role: String,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

pub fn require_caller(req: &Request) -> Result<Caller, serde_json::Value> {
    let Some(obj) = req.params.get("caller").and_then(|v| v.as_object()) else {
        return Err(err(&req.id, "bad_params", "missing caller", None));
    };
    let user_id = obj
        .get("userId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let role = obj
        .get("role")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let (Some(user_id), Some(role)) = (user_id, role) else {
        return Err(err(&req.id, "bad_params", "caller must carry userId and role", None));
    };
    if role != ROLE_ADMIN && role != ROLE_TEACHER && role != ROLE_STUDENT {
        return Err(err(&req.id, "bad_params", format!("unknown caller role: {}", role), None));
    }
    Ok(Caller { user_id, role })
}

pub fn require_admin(req: &Request) -> Result<Caller, serde_json::Value> {
    let caller = require_caller(req)?;
    if !caller.is_admin() {
        return Err(err(&req.id, "forbidden", "admin role required", None));
    }
    Ok(caller)
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
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

pub fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

pub fn parse_opt_string(v: Option<&JsonValue>) -> Result<Option<String>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v.as_str().ok_or("must be string or null")?.trim().to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

pub fn parse_opt_i64(v: Option<&JsonValue>) -> Result<Option<i64>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or("must be integer or null"),
    }
}

/// Required non-empty array of non-empty strings; duplicates are dropped
/// while the first-seen order is kept.
pub fn parse_required_id_array(v: Option<&JsonValue>, key: &str) -> Result<Vec<String>, String> {
    let Some(raw) = v else {
        return Err(format!("missing {}", key));
    };
    let arr = raw
        .as_array()
        .ok_or_else(|| format!("{} must be array of strings", key))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .ok_or_else(|| format!("{} must be array of strings", key))?
            .trim()
            .to_string();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    if out.is_empty() {
        return Err(format!("{} must contain at least one id", key));
    }
    Ok(out)
}

/// LIKE pattern for a quoted id inside a JSON array column. `%`, `_`
/// and `\` in the id are escaped so they match literally; pair with
/// `LIKE ? ESCAPE '\'`.
pub fn member_like_pattern(user_id: &str) -> String {
    let mut escaped = String::with_capacity(user_id.len());
    for c in user_id.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("%\"{}\"%", escaped)
}

pub fn json_array_string(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub fn parse_json_array_string(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

/// Directory lookup: display name and role for a user id.
pub fn lookup_user(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<(String, String)>, rusqlite::Error> {
    conn.query_row(
        "SELECT name, role FROM users WHERE id = ?",
        [user_id],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
    )
    .optional()
}

/// Catalog lookup: display name for a course id.
pub fn lookup_course_name(
    conn: &Connection,
    course_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row("SELECT name FROM courses WHERE id = ?", [course_id], |r| {
        r.get::<_, String>(0)
    })
    .optional()
}

/// Pagination defaults shared by the list operations.
pub fn parse_page(req: &Request) -> Result<(i64, i64), serde_json::Value> {
    let page = match parse_opt_i64(req.params.get("page")) {
        Ok(Some(v)) if v >= 1 => v,
        Ok(Some(_)) => return Err(err(&req.id, "bad_params", "page must be >= 1", None)),
        Ok(None) => 1,
        Err(m) => return Err(err(&req.id, "bad_params", format!("page {}", m), None)),
    };
    let page_size = match parse_opt_i64(req.params.get("pageSize")) {
        Ok(Some(v)) if (1..=100).contains(&v) => v,
        Ok(Some(_)) => {
            return Err(err(&req.id, "bad_params", "pageSize must be in 1..=100", None))
        }
        Ok(None) => 20,
        Err(m) => return Err(err(&req.id, "bad_params", format!("pageSize {}", m), None)),
    };
    Ok((page, page_size))
}
