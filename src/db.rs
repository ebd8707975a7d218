use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("tutorbook.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Idempotent schema creation. Also used by unit tests against an
/// in-memory connection.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    // Collaborator directory: pre-registered (pending) and activated users.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            phone TEXT,
            active INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Lesson occurrences. course/teacher/student ids are weak references
    // into the collaborator tables; names are write-time snapshots.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            course_name TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            teacher_name TEXT NOT NULL,
            student_ids_json TEXT NOT NULL,
            student_names_json TEXT NOT NULL,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            location TEXT,
            status TEXT NOT NULL,
            reminder_sent INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            created_by TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_teacher_date ON lessons(teacher_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_date ON lessons(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_reminder ON lessons(date, status, reminder_sent)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            course_id TEXT NOT NULL,
            course_name TEXT NOT NULL,
            total_lessons INTEGER NOT NULL,
            used_lessons INTEGER NOT NULL,
            remaining_lessons INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_pair ON enrollments(student_id, course_id)",
        [],
    )?;
    // At most one active package per (student, course).
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_enrollments_active
         ON enrollments(student_id, course_id) WHERE status = 'active'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lesson_feedback(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL UNIQUE,
            teacher_id TEXT NOT NULL,
            content TEXT NOT NULL,
            rating INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(lesson_id) REFERENCES lessons(id)
        )",
        [],
    )?;

    // Stand-in for the push transport: one row per dispatched reminder.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS reminder_outbox(
            id TEXT PRIMARY KEY,
            lesson_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            recipient_role TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(lesson_id) REFERENCES lessons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbox_lesson ON reminder_outbox(lesson_id)",
        [],
    )?;

    Ok(())
}
