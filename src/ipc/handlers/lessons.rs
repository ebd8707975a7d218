use crate::conflict;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, json_array_string, lookup_course_name, lookup_user, member_like_pattern, now_ts,
    parse_json_array_string, parse_opt_i64, parse_opt_string, parse_page, parse_required_id_array,
    require_admin, require_caller, required_str, ROLE_STUDENT, ROLE_TEACHER,
};
use crate::ipc::types::{AppState, Request};
use crate::timeutil;
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const STATUS_SCHEDULED: &str = "scheduled";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_CANCELLED: &str = "cancelled";

const MIN_REPEAT_WEEKS: i64 = 2;
const MAX_REPEAT_WEEKS: i64 = 52;

fn valid_status(status: &str) -> bool {
    matches!(status, STATUS_SCHEDULED | STATUS_COMPLETED | STATUS_CANCELLED)
}

#[derive(Debug, Clone)]
struct LessonRow {
    id: String,
    course_id: String,
    course_name: String,
    teacher_id: String,
    teacher_name: String,
    student_ids: Vec<String>,
    student_names: Vec<String>,
    date: String,
    start_time: String,
    end_time: String,
    location: Option<String>,
    status: String,
    reminder_sent: bool,
    created_at: String,
    updated_at: String,
    created_by: String,
}

const LESSON_COLUMNS: &str = "id, course_id, course_name, teacher_id, teacher_name, \
     student_ids_json, student_names_json, date, start_time, end_time, location, status, \
     reminder_sent, created_at, updated_at, created_by";

fn row_to_lesson(r: &rusqlite::Row) -> rusqlite::Result<LessonRow> {
    let ids_raw: String = r.get(5)?;
    let names_raw: String = r.get(6)?;
    Ok(LessonRow {
        id: r.get(0)?,
        course_id: r.get(1)?,
        course_name: r.get(2)?,
        teacher_id: r.get(3)?,
        teacher_name: r.get(4)?,
        student_ids: parse_json_array_string(&ids_raw),
        student_names: parse_json_array_string(&names_raw),
        date: r.get(7)?,
        start_time: r.get(8)?,
        end_time: r.get(9)?,
        location: r.get(10)?,
        status: r.get(11)?,
        reminder_sent: r.get::<_, i64>(12)? != 0,
        created_at: r.get(13)?,
        updated_at: r.get(14)?,
        created_by: r.get(15)?,
    })
}

fn load_lesson(conn: &Connection, id: &str) -> Result<Option<LessonRow>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {} FROM lessons WHERE id = ?", LESSON_COLUMNS),
        [id],
        |r| row_to_lesson(r),
    )
    .optional()
}

fn lesson_json(l: &LessonRow) -> serde_json::Value {
    json!({
        "id": l.id,
        "courseId": l.course_id,
        "courseName": l.course_name,
        "teacherId": l.teacher_id,
        "teacherName": l.teacher_name,
        "studentIds": l.student_ids,
        "studentNames": l.student_names,
        "date": l.date,
        "startTime": l.start_time,
        "endTime": l.end_time,
        "location": l.location,
        "status": l.status,
        "reminderSent": l.reminder_sent,
        "createdAt": l.created_at,
        "updatedAt": l.updated_at,
        "createdBy": l.created_by,
    })
}

/// Course/teacher/student display names snapshotted at write time.
struct Snapshots {
    course_name: String,
    teacher_name: String,
    student_names: Vec<String>,
}

fn resolve_snapshots(
    conn: &Connection,
    req: &Request,
    course_id: &str,
    teacher_id: &str,
    student_ids: &[String],
) -> Result<Snapshots, serde_json::Value> {
    let course_name = match lookup_course_name(conn, course_id) {
        Ok(Some(v)) => v,
        Ok(None) => return Err(err(&req.id, "not_found", "course not found", None)),
        Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    };
    let teacher_name = match lookup_user(conn, teacher_id) {
        Ok(Some((name, role))) => {
            if role != ROLE_TEACHER {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "teacherId does not refer to a teacher",
                    None,
                ));
            }
            name
        }
        Ok(None) => return Err(err(&req.id, "not_found", "teacher not found", None)),
        Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    };
    let mut student_names = Vec::with_capacity(student_ids.len());
    for student_id in student_ids {
        match lookup_user(conn, student_id) {
            Ok(Some((name, role))) => {
                if role != ROLE_STUDENT {
                    return Err(err(
                        &req.id,
                        "bad_params",
                        format!("{} does not refer to a student", student_id),
                        None,
                    ));
                }
                student_names.push(name);
            }
            Ok(None) => {
                return Err(err(
                    &req.id,
                    "not_found",
                    format!("student not found: {}", student_id),
                    None,
                ))
            }
            Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
        }
    }
    Ok(Snapshots {
        course_name,
        teacher_name,
        student_names,
    })
}

fn validate_civil_fields(
    req: &Request,
    date: &str,
    start_time: &str,
    end_time: &str,
) -> Result<(), serde_json::Value> {
    if !timeutil::valid_date(date) {
        return Err(err(&req.id, "bad_params", "date must be YYYY-MM-DD", None));
    }
    if !timeutil::valid_time(start_time) || !timeutil::valid_time(end_time) {
        return Err(err(&req.id, "bad_params", "times must be HH:mm", None));
    }
    if start_time >= end_time {
        return Err(err(&req.id, "bad_params", "startTime must be before endTime", None));
    }
    Ok(())
}

/// Both conflict checks for a proposed slot, teacher first. The error
/// names the conflicting course and time range (and the student, for a
/// student-side collision).
fn check_conflicts(
    conn: &Connection,
    req: &Request,
    teacher_id: &str,
    student_ids: &[String],
    student_names: &[String],
    date: &str,
    start_time: &str,
    end_time: &str,
    exclude_lesson_id: Option<&str>,
) -> Result<(), serde_json::Value> {
    match conflict::check_teacher(conn, teacher_id, date, start_time, end_time, exclude_lesson_id)
    {
        Ok(Some(c)) => {
            return Err(err(
                &req.id,
                "conflict",
                format!(
                    "teacher is already booked {} {}-{} ({})",
                    date, c.start_time, c.end_time, c.course_name
                ),
                Some(json!({ "conflictingLessonId": c.lesson_id })),
            ))
        }
        Ok(None) => {}
        Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
    match conflict::check_students(conn, student_ids, date, start_time, end_time, exclude_lesson_id)
    {
        Ok(Some((student_id, c))) => {
            let student_name = student_ids
                .iter()
                .position(|s| *s == student_id)
                .and_then(|i| student_names.get(i).cloned())
                .unwrap_or_else(|| student_id.clone());
            Err(err(
                &req.id,
                "conflict",
                format!(
                    "{} is already booked {} {}-{} ({})",
                    student_name, date, c.start_time, c.end_time, c.course_name
                ),
                Some(json!({ "conflictingLessonId": c.lesson_id, "studentId": student_id })),
            ))
        }
        Ok(None) => Ok(()),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_lesson(
    conn: &Connection,
    course_id: &str,
    teacher_id: &str,
    student_ids: &[String],
    snapshots: &Snapshots,
    date: &str,
    start_time: &str,
    end_time: &str,
    location: Option<&str>,
    created_by: &str,
) -> Result<String, rusqlite::Error> {
    let lesson_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    conn.execute(
        "INSERT INTO lessons(
            id, course_id, course_name, teacher_id, teacher_name,
            student_ids_json, student_names_json, date, start_time, end_time,
            location, status, reminder_sent, created_at, updated_at, created_by
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        params![
            lesson_id,
            course_id,
            snapshots.course_name,
            teacher_id,
            snapshots.teacher_name,
            json_array_string(student_ids),
            json_array_string(&snapshots.student_names),
            date,
            start_time,
            end_time,
            location,
            STATUS_SCHEDULED,
            ts,
            ts,
            created_by
        ],
    )?;
    Ok(lesson_id)
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_admin(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_ids = match parse_required_id_array(req.params.get("studentIds"), "studentIds") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let date = match required_str(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_time = match required_str(req, "startTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_time = match required_str(req, "endTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let location = match parse_opt_string(req.params.get("location")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("location {}", m), None),
    };
    if let Err(e) = validate_civil_fields(req, &date, &start_time, &end_time) {
        return e;
    }

    // Check-then-write runs inside one transaction; the sidecar is the
    // single writer to the workspace database.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    let snapshots = match resolve_snapshots(&tx, req, &course_id, &teacher_id, &student_ids) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_conflicts(
        &tx,
        req,
        &teacher_id,
        &student_ids,
        &snapshots.student_names,
        &date,
        &start_time,
        &end_time,
        None,
    ) {
        return e;
    }
    let lesson_id = match insert_lesson(
        &tx,
        &course_id,
        &teacher_id,
        &student_ids,
        &snapshots,
        &date,
        &start_time,
        &end_time,
        location.as_deref(),
        &caller.user_id,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "lessonId": lesson_id }))
}

fn handle_batch_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_admin(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_ids = match parse_required_id_array(req.params.get("studentIds"), "studentIds") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let seed_date = match required_str(req, "seedDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_time = match required_str(req, "startTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_time = match required_str(req, "endTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let location = match parse_opt_string(req.params.get("location")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("location {}", m), None),
    };
    let repeat_weeks = match parse_opt_i64(req.params.get("repeatWeeks")) {
        Ok(Some(v)) if (MIN_REPEAT_WEEKS..=MAX_REPEAT_WEEKS).contains(&v) => v,
        Ok(Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                format!("repeatWeeks must be in {}..={}", MIN_REPEAT_WEEKS, MAX_REPEAT_WEEKS),
                None,
            )
        }
        Ok(None) => return err(&req.id, "bad_params", "missing repeatWeeks", None),
        Err(m) => return err(&req.id, "bad_params", format!("repeatWeeks {}", m), None),
    };
    if let Err(e) = validate_civil_fields(req, &seed_date, &start_time, &end_time) {
        return e;
    }
    let seed = match timeutil::parse_date(&seed_date) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "seedDate must be YYYY-MM-DD", None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    // Names are snapshotted once and shared by every occurrence.
    let snapshots = match resolve_snapshots(&tx, req, &course_id, &teacher_id, &student_ids) {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Partial success by design: a conflicting week is skipped, the rest
    // of the series is still created.
    let mut created_ids = Vec::new();
    let mut skipped_dates = Vec::new();
    for date in timeutil::occurrence_dates(seed, repeat_weeks as u32) {
        let teacher_hit = match conflict::check_teacher(
            &tx,
            &teacher_id,
            &date,
            &start_time,
            &end_time,
            None,
        ) {
            Ok(v) => v.is_some(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let student_hit = if teacher_hit {
            true
        } else {
            match conflict::check_students(
                &tx,
                &student_ids,
                &date,
                &start_time,
                &end_time,
                None,
            ) {
                Ok(v) => v.is_some(),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        };
        if teacher_hit || student_hit {
            skipped_dates.push(date);
            continue;
        }
        match insert_lesson(
            &tx,
            &course_id,
            &teacher_id,
            &student_ids,
            &snapshots,
            &date,
            &start_time,
            &end_time,
            location.as_deref(),
            &caller.user_id,
        ) {
            Ok(id) => created_ids.push(id),
            Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "createdCount": created_ids.len(),
            "createdIds": created_ids,
            "skippedDates": skipped_dates,
            "requestedTotal": repeat_weeks,
        }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let existing = match load_lesson(conn, &lesson_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "lesson not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.status == STATUS_CANCELLED {
        return err(&req.id, "invalid_state", "cancelled lesson cannot be edited", None);
    }

    // Merge the patch over the stored record into an effective state.
    let course_id = match parse_opt_string(patch.get("courseId")) {
        Ok(v) => v.unwrap_or_else(|| existing.course_id.clone()),
        Err(m) => return err(&req.id, "bad_params", format!("patch.courseId {}", m), None),
    };
    let teacher_id = match parse_opt_string(patch.get("teacherId")) {
        Ok(v) => v.unwrap_or_else(|| existing.teacher_id.clone()),
        Err(m) => return err(&req.id, "bad_params", format!("patch.teacherId {}", m), None),
    };
    let student_ids = if patch.contains_key("studentIds") {
        match parse_required_id_array(patch.get("studentIds"), "studentIds") {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        }
    } else {
        existing.student_ids.clone()
    };
    let date = match parse_opt_string(patch.get("date")) {
        Ok(v) => v.unwrap_or_else(|| existing.date.clone()),
        Err(m) => return err(&req.id, "bad_params", format!("patch.date {}", m), None),
    };
    let start_time = match parse_opt_string(patch.get("startTime")) {
        Ok(v) => v.unwrap_or_else(|| existing.start_time.clone()),
        Err(m) => return err(&req.id, "bad_params", format!("patch.startTime {}", m), None),
    };
    let end_time = match parse_opt_string(patch.get("endTime")) {
        Ok(v) => v.unwrap_or_else(|| existing.end_time.clone()),
        Err(m) => return err(&req.id, "bad_params", format!("patch.endTime {}", m), None),
    };
    // An explicit null clears the location.
    let location = if patch.contains_key("location") {
        match parse_opt_string(patch.get("location")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("patch.location {}", m), None),
        }
    } else {
        existing.location.clone()
    };
    if let Err(e) = validate_civil_fields(req, &date, &start_time, &end_time) {
        return e;
    }

    let course_changed = course_id != existing.course_id;
    let teacher_changed = teacher_id != existing.teacher_id;
    let students_changed = student_ids != existing.student_ids;
    let date_changed = date != existing.date;
    let time_changed = start_time != existing.start_time || end_time != existing.end_time;

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    // Re-resolve and re-snapshot only what changed; untouched snapshots
    // keep their original write-time values.
    let mut course_name = existing.course_name.clone();
    let mut teacher_name = existing.teacher_name.clone();
    let mut student_names = existing.student_names.clone();
    if course_changed {
        course_name = match lookup_course_name(&tx, &course_id) {
            Ok(Some(v)) => v,
            Ok(None) => return err(&req.id, "not_found", "course not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    }
    if teacher_changed || students_changed {
        let ids_for_lookup = &student_ids;
        let snapshots = match resolve_snapshots(&tx, req, &course_id, &teacher_id, ids_for_lookup)
        {
            Ok(v) => v,
            Err(e) => return e,
        };
        if teacher_changed {
            teacher_name = snapshots.teacher_name;
        }
        if students_changed {
            student_names = snapshots.student_names;
        }
        if course_changed {
            course_name = snapshots.course_name;
        }
    }

    if date_changed || time_changed || teacher_changed || students_changed {
        if let Err(e) = check_conflicts(
            &tx,
            req,
            &teacher_id,
            &student_ids,
            &student_names,
            &date,
            &start_time,
            &end_time,
            Some(&lesson_id),
        ) {
            return e;
        }
    }

    // A moved lesson has to be reminded again.
    let reminder_sent = if (date_changed || start_time != existing.start_time)
        && existing.status == STATUS_SCHEDULED
    {
        false
    } else {
        existing.reminder_sent
    };

    if let Err(e) = tx.execute(
        "UPDATE lessons SET
            course_id = ?, course_name = ?, teacher_id = ?, teacher_name = ?,
            student_ids_json = ?, student_names_json = ?, date = ?, start_time = ?,
            end_time = ?, location = ?, reminder_sent = ?, updated_at = ?
         WHERE id = ?",
        params![
            course_id,
            course_name,
            teacher_id,
            teacher_name,
            json_array_string(&student_ids),
            json_array_string(&student_names),
            date,
            start_time,
            end_time,
            location,
            if reminder_sent { 1 } else { 0 },
            now_ts(),
            lesson_id
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({}))
}

fn transition_status(
    state: &mut AppState,
    req: &Request,
    target: &str,
) -> serde_json::Value {
    if let Err(e) = require_admin(req) {
        return e;
    }
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lesson_id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status: Option<String> = match conn
        .query_row("SELECT status FROM lessons WHERE id = ?", [&lesson_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(status) = status else {
        return err(&req.id, "not_found", "lesson not found", None);
    };
    // Both terminal states reject further transitions; a second cancel or
    // complete is an error so caller bugs surface instead of being
    // silently absorbed.
    if status != STATUS_SCHEDULED {
        return err(
            &req.id,
            "invalid_state",
            format!("lesson is {}, expected scheduled", status),
            None,
        );
    }
    if let Err(e) = conn.execute(
        "UPDATE lessons SET status = ?, updated_at = ? WHERE id = ?",
        params![target, now_ts(), lesson_id],
    ) {
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
    let lesson_id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let lesson = match load_lesson(conn, &lesson_id) {
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
    ok(&req.id, json!({ "lesson": lesson_json(&lesson) }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_caller(req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let (page, page_size) = match parse_page(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    let date = match parse_opt_string(req.params.get("date")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("date {}", m), None),
    };
    if let Some(date) = date {
        clauses.push("date = ?");
        args.push(Value::Text(date));
    }
    let course_id = match parse_opt_string(req.params.get("courseId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("courseId {}", m), None),
    };
    if let Some(course_id) = course_id {
        clauses.push("course_id = ?");
        args.push(Value::Text(course_id));
    }
    let status = match parse_opt_string(req.params.get("status")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("status {}", m), None),
    };
    if let Some(status) = status {
        if !valid_status(&status) {
            return err(&req.id, "bad_params", format!("unknown status: {}", status), None);
        }
        clauses.push("status = ?");
        args.push(Value::Text(status));
    }
    let teacher_filter = match parse_opt_string(req.params.get("teacherId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("teacherId {}", m), None),
    };

    // Non-admin callers only ever see their own lessons.
    match caller.role.as_str() {
        ROLE_TEACHER => {
            clauses.push("teacher_id = ?");
            args.push(Value::Text(caller.user_id.clone()));
        }
        ROLE_STUDENT => {
            clauses.push("student_ids_json LIKE ? ESCAPE '\\'");
            args.push(Value::Text(member_like_pattern(&caller.user_id)));
        }
        _ => {
            if let Some(teacher_id) = teacher_filter {
                clauses.push("teacher_id = ?");
                args.push(Value::Text(teacher_id));
            }
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = match conn.query_row(
        &format!("SELECT COUNT(*) FROM lessons{}", where_sql),
        params_from_iter(args.iter()),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut page_args = args.clone();
    page_args.push(Value::Integer(page_size));
    page_args.push(Value::Integer((page - 1) * page_size));
    let sql = format!(
        "SELECT {} FROM lessons{} ORDER BY date, start_time, id LIMIT ? OFFSET ?",
        LESSON_COLUMNS, where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let lessons = match stmt.query_map(params_from_iter(page_args.iter()), |r| {
        row_to_lesson(r).map(|l| lesson_json(&l))
    }) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "lessons": lessons,
            "total": total,
            "page": page,
            "pageSize": page_size,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lesson.create" => Some(handle_create(state, req)),
        "lesson.batchCreate" => Some(handle_batch_create(state, req)),
        "lesson.update" => Some(handle_update(state, req)),
        "lesson.cancel" => Some(transition_status(state, req, STATUS_CANCELLED)),
        "lesson.complete" => Some(transition_status(state, req, STATUS_COMPLETED)),
        "lesson.get" => Some(handle_get(state, req)),
        "lesson.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
