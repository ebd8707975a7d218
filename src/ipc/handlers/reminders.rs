use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_json_array_string, parse_opt_string};
use crate::ipc::types::{AppState, Request};
use crate::notify::ReminderMessage;
use crate::timeutil::{self, ReminderWindow};
use rusqlite::{params, params_from_iter, types::Value, Connection};
use serde_json::json;
use std::collections::{HashMap, HashSet};

const WINDOW_MINUTES: i64 = 15;
// Per-invocation scan caps; lessons past the cap stay unmarked and are
// picked up by the next tick.
const SAME_DAY_LIMIT: i64 = 100;
const SEGMENT_LIMIT: i64 = 50;

struct DueLesson {
    id: String,
    course_name: String,
    teacher_id: String,
    student_ids: Vec<String>,
    date: String,
    start_time: String,
    end_time: String,
    location: Option<String>,
}

fn due_segment(
    conn: &Connection,
    date: &str,
    from: Option<&str>,
    to: Option<&str>,
    limit: i64,
) -> Result<Vec<DueLesson>, rusqlite::Error> {
    let mut sql = String::from(
        "SELECT id, course_name, teacher_id, student_ids_json, date, start_time, end_time, location
         FROM lessons
         WHERE date = ? AND status = 'scheduled' AND reminder_sent = 0",
    );
    let mut args: Vec<Value> = vec![Value::Text(date.to_string())];
    if let Some(from) = from {
        sql.push_str(" AND start_time >= ?");
        args.push(Value::Text(from.to_string()));
    }
    if let Some(to) = to {
        sql.push_str(" AND start_time <= ?");
        args.push(Value::Text(to.to_string()));
    }
    sql.push_str(" ORDER BY start_time, id LIMIT ?");
    args.push(Value::Integer(limit));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |r| {
        let ids_raw: String = r.get(3)?;
        Ok(DueLesson {
            id: r.get(0)?,
            course_name: r.get(1)?,
            teacher_id: r.get(2)?,
            student_ids: parse_json_array_string(&ids_raw),
            date: r.get(4)?,
            start_time: r.get(5)?,
            end_time: r.get(6)?,
            location: r.get(7)?,
        })
    })?;
    rows.collect()
}

fn due_lessons(conn: &Connection, window: &ReminderWindow) -> Result<Vec<DueLesson>, rusqlite::Error> {
    match window {
        ReminderWindow::SameDay { date, from, to } => {
            due_segment(conn, date, Some(from), Some(to), SAME_DAY_LIMIT)
        }
        ReminderWindow::CrossMidnight {
            first_date,
            from,
            second_date,
            to,
        } => {
            // Two date-bound sub-queries unioned.
            let mut out = due_segment(conn, first_date, Some(from), None, SEGMENT_LIMIT)?;
            out.extend(due_segment(conn, second_date, None, Some(to), SEGMENT_LIMIT)?);
            Ok(out)
        }
    }
}

/// Batched directory lookup for every recipient of every due lesson.
fn recipient_roles(
    conn: &Connection,
    lessons: &[DueLesson],
) -> Result<HashMap<String, String>, rusqlite::Error> {
    let mut ids: HashSet<&str> = HashSet::new();
    for lesson in lessons {
        ids.insert(lesson.teacher_id.as_str());
        for s in &lesson.student_ids {
            ids.insert(s.as_str());
        }
    }
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT id, role FROM users WHERE id IN ({})", placeholders);
    let args: Vec<Value> = ids.into_iter().map(|s| Value::Text(s.to_string())).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    rows.collect()
}

fn handle_dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    // Tests may pin "now"; production invocations leave it unset.
    let now = match parse_opt_string(req.params.get("now")) {
        Ok(Some(raw)) => match timeutil::parse_civil(&raw) {
            Some(v) => v,
            None => return err(&req.id, "bad_params", "now must be YYYY-MM-DD HH:mm", None),
        },
        Ok(None) => timeutil::civil_now(),
        Err(m) => return err(&req.id, "bad_params", format!("now {}", m), None),
    };
    let window = timeutil::reminder_window(now, WINDOW_MINUTES);

    let lessons = match due_lessons(conn, &window) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if lessons.is_empty() {
        return ok(
            &req.id,
            json!({ "lessonsProcessed": 0, "sent": 0, "errors": [] }),
        );
    }
    let roles = match recipient_roles(conn, &lessons) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut sent = 0usize;
    let mut errors = Vec::new();
    for lesson in &lessons {
        let body = format!(
            "Upcoming lesson: {} on {} {}-{} at {}",
            lesson.course_name,
            lesson.date,
            lesson.start_time,
            lesson.end_time,
            lesson.location.as_deref().unwrap_or("TBD")
        );
        let mut recipients: Vec<&str> = Vec::with_capacity(1 + lesson.student_ids.len());
        recipients.push(lesson.teacher_id.as_str());
        recipients.extend(lesson.student_ids.iter().map(String::as_str));

        // Per-recipient failures are collected and never block siblings.
        for recipient_id in recipients {
            let Some(role) = roles.get(recipient_id) else {
                errors.push(json!({
                    "lessonId": lesson.id,
                    "recipientId": recipient_id,
                    "error": "recipient not found in directory",
                }));
                continue;
            };
            let msg = ReminderMessage {
                lesson_id: &lesson.id,
                recipient_id,
                recipient_role: role,
                body: body.clone(),
            };
            match state.transport.send(conn, &msg) {
                Ok(()) => sent += 1,
                Err(e) => errors.push(json!({
                    "lessonId": lesson.id,
                    "recipientId": recipient_id,
                    "error": e,
                })),
            }
        }

        // A lesson is only ever considered once, regardless of individual
        // delivery failures.
        if let Err(e) = conn.execute(
            "UPDATE lessons SET reminder_sent = 1 WHERE id = ?",
            params![lesson.id],
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(
        &req.id,
        json!({
            "lessonsProcessed": lessons.len(),
            "sent": sent,
            "errors": errors,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reminders.dispatch" => Some(handle_dispatch(state, req)),
        _ => None,
    }
}
