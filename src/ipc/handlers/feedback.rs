use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_ts, parse_json_array_string, parse_opt_i64, parse_opt_string, require_caller,
    required_str, ROLE_TEACHER,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn parse_rating(v: Option<&serde_json::Value>, req: &Request) -> Result<Option<i64>, serde_json::Value> {
    match parse_opt_i64(v) {
        Ok(Some(r)) if (1..=5).contains(&r) => Ok(Some(r)),
        Ok(Some(_)) => Err(err(&req.id, "bad_params", "rating must be in 1..=5", None)),
        Ok(None) => Ok(None),
        Err(m) => Err(err(&req.id, "bad_params", format!("rating {}", m), None)),
    }
}

struct LessonAccess {
    teacher_id: String,
    student_ids: Vec<String>,
    status: String,
}

fn load_lesson_access(
    conn: &Connection,
    lesson_id: &str,
) -> Result<Option<LessonAccess>, rusqlite::Error> {
    conn.query_row(
        "SELECT teacher_id, student_ids_json, status FROM lessons WHERE id = ?",
        [lesson_id],
        |r| {
            let ids_raw: String = r.get(1)?;
            Ok(LessonAccess {
                teacher_id: r.get(0)?,
                student_ids: parse_json_array_string(&ids_raw),
                status: r.get(2)?,
            })
        },
    )
    .optional()
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_caller(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if caller.role != ROLE_TEACHER {
        return err(&req.id, "forbidden", "only teachers submit feedback", None);
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let content = match required_str(req, "content") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rating = match parse_rating(req.params.get("rating"), req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let lesson = match load_lesson_access(conn, &lesson_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "lesson not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if lesson.teacher_id != caller.user_id {
        return err(&req.id, "forbidden", "not the assigned teacher", None);
    }
    if lesson.status != "completed" {
        return err(&req.id, "invalid_state", "feedback requires a completed lesson", None);
    }
    let existing = conn
        .query_row(
            "SELECT 1 FROM lesson_feedback WHERE lesson_id = ? LIMIT 1",
            [&lesson_id],
            |_r| Ok(()),
        )
        .optional();
    match existing {
        Ok(Some(_)) => return err(&req.id, "conflict", "feedback already submitted for this lesson", None),
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let feedback_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO lesson_feedback(id, lesson_id, teacher_id, content, rating, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![feedback_id, lesson_id, caller.user_id, content, rating, ts, ts],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "feedbackId": feedback_id }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_caller(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if caller.role != ROLE_TEACHER {
        return err(&req.id, "forbidden", "only teachers edit feedback", None);
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let feedback_id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let content = match parse_opt_string(req.params.get("content")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("content {}", m), None),
    };
    let rating_supplied = req.params.get("rating").is_some();
    let rating = match parse_rating(req.params.get("rating"), req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if content.is_none() && !rating_supplied {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let author: Option<String> = match conn
        .query_row(
            "SELECT teacher_id FROM lesson_feedback WHERE id = ?",
            [&feedback_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(author) = author else {
        return err(&req.id, "not_found", "feedback not found", None);
    };
    if author != caller.user_id {
        return err(&req.id, "forbidden", "not the authoring teacher", None);
    }

    let ts = now_ts();
    let result = match (&content, rating_supplied) {
        (Some(content), true) => conn.execute(
            "UPDATE lesson_feedback SET content = ?, rating = ?, updated_at = ? WHERE id = ?",
            params![content, rating, ts, feedback_id],
        ),
        (Some(content), false) => conn.execute(
            "UPDATE lesson_feedback SET content = ?, updated_at = ? WHERE id = ?",
            params![content, ts, feedback_id],
        ),
        (None, _) => conn.execute(
            "UPDATE lesson_feedback SET rating = ?, updated_at = ? WHERE id = ?",
            params![rating, ts, feedback_id],
        ),
    };
    if let Err(e) = result {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({}))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_caller(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let lesson = match load_lesson_access(conn, &lesson_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "lesson not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let allowed = caller.is_admin()
        || lesson.teacher_id == caller.user_id
        || lesson.student_ids.iter().any(|s| *s == caller.user_id);
    if !allowed {
        return err(&req.id, "forbidden", "no access to this lesson", None);
    }

    let row = conn
        .query_row(
            "SELECT id, lesson_id, teacher_id, content, rating, created_at, updated_at
             FROM lesson_feedback WHERE lesson_id = ?",
            [&lesson_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "lessonId": r.get::<_, String>(1)?,
                    "teacherId": r.get::<_, String>(2)?,
                    "content": r.get::<_, String>(3)?,
                    "rating": r.get::<_, Option<i64>>(4)?,
                    "createdAt": r.get::<_, String>(5)?,
                    "updatedAt": r.get::<_, String>(6)?,
                }))
            },
        )
        .optional();
    match row {
        Ok(Some(feedback)) => ok(&req.id, json!({ "feedback": feedback })),
        Ok(None) => err(&req.id, "not_found", "no feedback for this lesson", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feedback.submit" => Some(handle_submit(state, req)),
        "feedback.update" => Some(handle_update(state, req)),
        "feedback.get" => Some(handle_get(state, req)),
        _ => None,
    }
}
