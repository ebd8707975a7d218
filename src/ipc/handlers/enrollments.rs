use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, lookup_course_name, lookup_user, now_ts, parse_opt_i64, parse_opt_string, parse_page,
    parse_required_id_array, require_admin, require_caller, required_str, ROLE_STUDENT,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_COMPLETED: &str = "completed";

const ENROLLMENT_COLUMNS: &str = "id, student_id, student_name, course_id, course_name, \
     total_lessons, used_lessons, remaining_lessons, status, created_at, updated_at";

fn row_to_json(r: &Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "courseId": r.get::<_, String>(3)?,
        "courseName": r.get::<_, String>(4)?,
        "totalLessons": r.get::<_, i64>(5)?,
        "usedLessons": r.get::<_, i64>(6)?,
        "remainingLessons": r.get::<_, i64>(7)?,
        "status": r.get::<_, String>(8)?,
        "createdAt": r.get::<_, String>(9)?,
        "updatedAt": r.get::<_, String>(10)?,
    }))
}

fn active_enrollment_exists(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT 1 FROM enrollments WHERE student_id = ? AND course_id = ? AND status = 'active' LIMIT 1",
        params![student_id, course_id],
        |_r| Ok(()),
    )
    .optional()
    .map(|v| v.is_some())
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let total_lessons = match parse_opt_i64(req.params.get("totalLessons")) {
        Ok(Some(v)) if v >= 1 => v,
        Ok(Some(_)) => return err(&req.id, "bad_params", "totalLessons must be >= 1", None),
        Ok(None) => return err(&req.id, "bad_params", "missing totalLessons", None),
        Err(m) => return err(&req.id, "bad_params", format!("totalLessons {}", m), None),
    };

    let student_name = match lookup_user(conn, &student_id) {
        Ok(Some((name, role))) => {
            if role != ROLE_STUDENT {
                return err(&req.id, "bad_params", "studentId does not refer to a student", None);
            }
            name
        }
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let course_name = match lookup_course_name(conn, &course_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match active_enrollment_exists(conn, &student_id, &course_id) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "an active enrollment already exists for this student and course; revise it instead",
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let enrollment_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(
            id, student_id, student_name, course_id, course_name,
            total_lessons, used_lessons, remaining_lessons, status, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, 0, ?, 'active', ?, ?)",
        params![
            enrollment_id,
            student_id,
            student_name,
            course_id,
            course_name,
            total_lessons,
            total_lessons,
            ts,
            ts
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "enrollmentId": enrollment_id }))
}

fn handle_revise_total(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let new_total = match parse_opt_i64(req.params.get("newTotal")) {
        Ok(Some(v)) if v >= 1 => v,
        Ok(Some(_)) => return err(&req.id, "bad_params", "newTotal must be >= 1", None),
        Ok(None) => return err(&req.id, "bad_params", "missing newTotal", None),
        Err(m) => return err(&req.id, "bad_params", format!("newTotal {}", m), None),
    };

    let used: Option<i64> = match conn
        .query_row(
            "SELECT used_lessons FROM enrollments WHERE id = ?",
            [&enrollment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(used) = used else {
        return err(&req.id, "not_found", "enrollment not found", None);
    };
    if new_total < used {
        return err(
            &req.id,
            "invalid_state",
            format!("newTotal {} is below already-used lessons {}", new_total, used),
            None,
        );
    }

    let remaining = (new_total - used).max(0);
    let status = if remaining <= 0 { STATUS_COMPLETED } else { STATUS_ACTIVE };
    if let Err(e) = conn.execute(
        "UPDATE enrollments SET total_lessons = ?, remaining_lessons = ?, status = ?, updated_at = ?
         WHERE id = ?",
        params![new_total, remaining, status, now_ts(), enrollment_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({}))
}

/// One credit per student off the active package for the course. The
/// increment is a single conditional UPDATE; a student without an active
/// enrollment gets a non-fatal per-student outcome instead of failing
/// the batch.
fn handle_deduct(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_ids = match parse_required_id_array(req.params.get("studentIds"), "studentIds") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let ts = now_ts();
    let mut outcomes = Vec::with_capacity(student_ids.len());
    for student_id in &student_ids {
        // Pin the active row's id up front; the unique index guarantees
        // at most one. Updating and re-reading by id keeps the reported
        // outcome tied to the row that was actually deducted, even when
        // older packages for the pair share the same updated_at second.
        let active_id: Option<String> = match conn
            .query_row(
                "SELECT id FROM enrollments
                 WHERE student_id = ? AND course_id = ? AND status = 'active'",
                params![student_id, course_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let Some(enrollment_id) = active_id else {
            outcomes.push(json!({
                "studentId": student_id,
                "deducted": false,
                "reason": "no active enrollment",
            }));
            continue;
        };
        let updated = conn.execute(
            "UPDATE enrollments SET
                used_lessons = used_lessons + 1,
                remaining_lessons = CASE WHEN total_lessons - used_lessons - 1 < 0
                                         THEN 0 ELSE total_lessons - used_lessons - 1 END,
                status = CASE WHEN total_lessons - used_lessons - 1 <= 0
                              THEN 'completed' ELSE 'active' END,
                updated_at = ?
             WHERE id = ? AND status = 'active'",
            params![ts, enrollment_id],
        );
        match updated {
            Ok(0) => outcomes.push(json!({
                "studentId": student_id,
                "deducted": false,
                "reason": "no active enrollment",
            })),
            Ok(_) => {
                let row = conn.query_row(
                    "SELECT remaining_lessons, status FROM enrollments WHERE id = ?",
                    [&enrollment_id],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
                );
                match row {
                    Ok((remaining, status)) => outcomes.push(json!({
                        "studentId": student_id,
                        "deducted": true,
                        "enrollmentId": enrollment_id,
                        "remainingLessons": remaining,
                        "status": status,
                    })),
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        }
    }
    ok(&req.id, json!({ "outcomes": outcomes }))
}

fn handle_list_by_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_caller(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let requested = match parse_opt_string(req.params.get("studentId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentId {}", m), None),
    };
    let student_id = if caller.is_admin() {
        match requested {
            Some(v) => v,
            None => return err(&req.id, "bad_params", "missing studentId", None),
        }
    } else if caller.role == ROLE_STUDENT {
        // Students only ever see their own packages.
        match requested {
            Some(v) if v != caller.user_id => {
                return err(&req.id, "forbidden", "students can only list their own enrollments", None)
            }
            _ => caller.user_id.clone(),
        }
    } else {
        return err(&req.id, "forbidden", "no access to enrollments", None);
    };

    let mut stmt = match conn.prepare(&format!(
        "SELECT {} FROM enrollments WHERE student_id = ? ORDER BY created_at DESC, id",
        ENROLLMENT_COLUMNS
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enrollments = match stmt.query_map([&student_id], row_to_json) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "enrollments": enrollments }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let (page, page_size) = match parse_page(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let total: i64 = match conn.query_row("SELECT COUNT(*) FROM enrollments", [], |r| r.get(0)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut stmt = match conn.prepare(&format!(
        "SELECT {} FROM enrollments ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
        ENROLLMENT_COLUMNS
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enrollments = match stmt.query_map(params![page_size, (page - 1) * page_size], row_to_json)
    {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "enrollments": enrollments,
            "total": total,
            "page": page,
            "pageSize": page_size,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollment.create" => Some(handle_create(state, req)),
        "enrollment.reviseTotal" => Some(handle_revise_total(state, req)),
        "enrollment.deduct" => Some(handle_deduct(state, req)),
        "enrollment.listByStudent" => Some(handle_list_by_student(state, req)),
        "enrollment.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
