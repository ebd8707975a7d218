use rusqlite::{params, Connection};

use crate::timeutil;

/// The first existing lesson found to overlap a proposed interval.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub lesson_id: String,
    pub course_name: String,
    pub start_time: String,
    pub end_time: String,
}

struct Candidate {
    id: String,
    course_name: String,
    start_time: String,
    end_time: String,
    student_ids: Vec<String>,
}

fn candidates_on_date(
    conn: &Connection,
    date: &str,
    exclude_lesson_id: Option<&str>,
) -> Result<Vec<Candidate>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, course_name, start_time, end_time, student_ids_json
         FROM lessons
         WHERE date = ? AND status != 'cancelled'
         ORDER BY start_time, id",
    )?;
    let rows = stmt.query_map(params![date], |r| {
        let ids_raw: String = r.get(4)?;
        Ok(Candidate {
            id: r.get(0)?,
            course_name: r.get(1)?,
            start_time: r.get(2)?,
            end_time: r.get(3)?,
            student_ids: serde_json::from_str(&ids_raw).unwrap_or_default(),
        })
    })?;
    let exclude = exclude_lesson_id.unwrap_or("");
    let mut out = Vec::new();
    for row in rows {
        let c = row?;
        if c.id != exclude {
            out.push(c);
        }
    }
    Ok(out)
}

fn to_conflict(c: &Candidate) -> Conflict {
    Conflict {
        lesson_id: c.id.clone(),
        course_name: c.course_name.clone(),
        start_time: c.start_time.clone(),
        end_time: c.end_time.clone(),
    }
}

/// Does the teacher already hold an overlapping non-cancelled lesson on
/// `date`? `exclude_lesson_id` lets an edit re-validate against everything
/// but its own prior record.
pub fn check_teacher(
    conn: &Connection,
    teacher_id: &str,
    date: &str,
    start_time: &str,
    end_time: &str,
    exclude_lesson_id: Option<&str>,
) -> Result<Option<Conflict>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, course_name, start_time, end_time
         FROM lessons
         WHERE teacher_id = ? AND date = ? AND status != 'cancelled'
         ORDER BY start_time, id",
    )?;
    let rows = stmt.query_map(params![teacher_id, date], |r| {
        Ok(Conflict {
            lesson_id: r.get(0)?,
            course_name: r.get(1)?,
            start_time: r.get(2)?,
            end_time: r.get(3)?,
        })
    })?;
    let exclude = exclude_lesson_id.unwrap_or("");
    for row in rows {
        let c = row?;
        if c.lesson_id == exclude {
            continue;
        }
        if timeutil::overlaps(start_time, end_time, &c.start_time, &c.end_time) {
            return Ok(Some(c));
        }
    }
    Ok(None)
}

/// Per-student independent check: the first student with an overlapping
/// non-cancelled lesson on `date` fails the whole proposal. Returns the
/// offending student id alongside the conflicting lesson.
pub fn check_students(
    conn: &Connection,
    student_ids: &[String],
    date: &str,
    start_time: &str,
    end_time: &str,
    exclude_lesson_id: Option<&str>,
) -> Result<Option<(String, Conflict)>, rusqlite::Error> {
    let candidates = candidates_on_date(conn, date, exclude_lesson_id)?;
    for student_id in student_ids {
        for c in &candidates {
            if !c.student_ids.iter().any(|s| s == student_id) {
                continue;
            }
            if timeutil::overlaps(start_time, end_time, &c.start_time, &c.end_time) {
                return Ok(Some((student_id.clone(), to_conflict(c))));
            }
        }
    }
    Ok(None)
}
