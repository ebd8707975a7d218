use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, json_array_string, now_ts, parse_json_array_string, parse_opt_string, require_admin,
    required_str, ROLE_ADMIN, ROLE_STUDENT, ROLE_TEACHER,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn valid_role(role: &str) -> bool {
    matches!(role, ROLE_ADMIN | ROLE_TEACHER | ROLE_STUDENT)
}

fn user_exists(conn: &Connection, id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row("SELECT 1 FROM users WHERE id = ? LIMIT 1", [id], |_r| Ok(()))
        .optional()
        .map(|v| v.is_some())
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = match required_str(req, "role") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !valid_role(&role) {
        return err(&req.id, "bad_params", format!("unknown role: {}", role), None);
    }
    let phone = match parse_opt_string(req.params.get("phone")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("phone {}", m), None),
    };
    // Pre-registration may pin an explicit id so the admin can hand it out.
    let user_id = match parse_opt_string(req.params.get("userId")) {
        Ok(Some(v)) => v,
        Ok(None) => Uuid::new_v4().to_string(),
        Err(m) => return err(&req.id, "bad_params", format!("userId {}", m), None),
    };
    match user_exists(conn, &user_id) {
        Ok(true) => return err(&req.id, "conflict", "user id already exists", None),
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let ts = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, role, phone, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, 0, ?, ?)",
        params![user_id, name, role, phone, ts, ts],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match parse_opt_string(req.params.get("name")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("name {}", m), None),
    };
    let phone_supplied = req.params.get("phone").is_some();
    let phone = match parse_opt_string(req.params.get("phone")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("phone {}", m), None),
    };
    if name.is_none() && !phone_supplied {
        return err(&req.id, "bad_params", "nothing to update", None);
    }
    match user_exists(conn, &user_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let ts = now_ts();
    let result = if let Some(name) = &name {
        if phone_supplied {
            conn.execute(
                "UPDATE users SET name = ?, phone = ?, updated_at = ? WHERE id = ?",
                params![name, phone, ts, user_id],
            )
        } else {
            conn.execute(
                "UPDATE users SET name = ?, updated_at = ? WHERE id = ?",
                params![name, ts, user_id],
            )
        }
    } else {
        conn.execute(
            "UPDATE users SET phone = ?, updated_at = ? WHERE id = ?",
            params![phone, ts, user_id],
        )
    };
    if let Err(e) = result {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({}))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let role = match parse_opt_string(req.params.get("role")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("role {}", m), None),
    };
    if let Some(r) = &role {
        if !valid_role(r) {
            return err(&req.id, "bad_params", format!("unknown role: {}", r), None);
        }
    }

    let sql = if role.is_some() {
        "SELECT id, name, role, phone, active FROM users WHERE role = ? ORDER BY name, id"
    } else {
        "SELECT id, name, role, phone, active FROM users ORDER BY role, name, id"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "role": r.get::<_, String>(2)?,
            "phone": r.get::<_, Option<String>>(3)?,
            "active": r.get::<_, i64>(4)? != 0,
        }))
    };
    let rows = if let Some(r) = &role {
        stmt.query_map([r], map_row)
    } else {
        stmt.query_map([], map_row)
    };
    let users = match rows {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "users": users }))
}

/// One-time repair sweep run when a pre-registered user record is
/// activated under its real identity: the user row is re-keyed and every
/// historical reference follows. Name snapshots on lessons and
/// enrollments stay as written.
fn handle_users_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let pending_id = match required_str(req, "pendingUserId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let new_id = match required_str(req, "newUserId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if pending_id == new_id {
        return err(&req.id, "bad_params", "newUserId must differ from pendingUserId", None);
    }

    let pending = conn
        .query_row(
            "SELECT name, role, phone, active, created_at FROM users WHERE id = ?",
            [&pending_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional();
    let (name, role, phone, active, created_at) = match pending {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "pending user not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if active != 0 {
        return err(&req.id, "invalid_state", "user is already active", None);
    }
    match user_exists(conn, &new_id) {
        Ok(true) => return err(&req.id, "conflict", "newUserId already exists", None),
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    let ts = now_ts();
    if let Err(e) = tx.execute(
        "INSERT INTO users(id, name, role, phone, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, 1, ?, ?)",
        params![new_id, name, role, phone, created_at, ts],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let lessons_as_teacher = match tx.execute(
        "UPDATE lessons SET teacher_id = ? WHERE teacher_id = ?",
        params![new_id, pending_id],
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    // Student membership lives in a JSON array column; rewrite the rows
    // that mention the pending id.
    let mut lessons_as_student = 0usize;
    let like = format!("%\"{}\"%", pending_id);
    let member_rows: Result<Vec<(String, String)>, rusqlite::Error> = (|| {
        let mut stmt = tx.prepare(
            "SELECT id, student_ids_json FROM lessons WHERE student_ids_json LIKE ?",
        )?;
        let rows = stmt.query_map([&like], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        rows.collect()
    })();
    let member_rows = match member_rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for (lesson_id, ids_raw) in member_rows {
        let mut ids = parse_json_array_string(&ids_raw);
        let mut changed = false;
        for slot in ids.iter_mut() {
            if *slot == pending_id {
                *slot = new_id.clone();
                changed = true;
            }
        }
        if !changed {
            continue;
        }
        if let Err(e) = tx.execute(
            "UPDATE lessons SET student_ids_json = ? WHERE id = ?",
            params![json_array_string(&ids), lesson_id],
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        lessons_as_student += 1;
    }

    let enrollments_updated = match tx.execute(
        "UPDATE enrollments SET student_id = ? WHERE student_id = ?",
        params![new_id, pending_id],
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE lesson_feedback SET teacher_id = ? WHERE teacher_id = ?",
        params![new_id, pending_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE reminder_outbox SET recipient_id = ? WHERE recipient_id = ?",
        params![new_id, pending_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&pending_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "userId": new_id,
            "lessonsUpdated": lessons_as_teacher + lessons_as_student,
            "enrollmentsUpdated": enrollments_updated,
        }),
    )
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match parse_opt_string(req.params.get("courseId")) {
        Ok(Some(v)) => v,
        Ok(None) => Uuid::new_v4().to_string(),
        Err(m) => return err(&req.id, "bad_params", format!("courseId {}", m), None),
    };
    let exists = conn
        .query_row("SELECT 1 FROM courses WHERE id = ? LIMIT 1", [&course_id], |_r| Ok(()))
        .optional();
    match exists {
        Ok(Some(_)) => return err(&req.id, "conflict", "course id already exists", None),
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let ts = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, name, created_at, updated_at) VALUES(?, ?, ?, ?)",
        params![course_id, name, ts, ts],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "courseId": course_id }))
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let updated = conn.execute(
        "UPDATE courses SET name = ?, updated_at = ? WHERE id = ?",
        params![name, now_ts(), course_id],
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", "course not found", None),
        Ok(_) => ok(&req.id, json!({})),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM courses ORDER BY name, id") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let courses = match stmt.query_map([], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
        }))
    }) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "courses": courses }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.activate" => Some(handle_users_activate(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        _ => None,
    }
}
