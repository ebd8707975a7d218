#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_tutorbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tutorbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn roundtrip(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = roundtrip(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Expects a rejected operation and returns its error object.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = roundtrip(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

pub fn db_path(workspace: &PathBuf) -> PathBuf {
    workspace.join("tutorbook.sqlite3")
}

pub fn admin() -> serde_json::Value {
    caller("admin-1", "admin")
}

pub fn caller(user_id: &str, role: &str) -> serde_json::Value {
    json!({ "userId": user_id, "role": role })
}

pub fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> PathBuf {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    workspace
}

/// One course, two teachers, three students with fixed ids, enough for
/// most scheduling scenarios.
pub fn seed_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-c1",
        "courses.create",
        json!({ "caller": admin(), "courseId": "c-math", "name": "Math" }),
    );
    let people = [
        ("t-1", "Ms. Wang", "teacher"),
        ("t-2", "Mr. Chen", "teacher"),
        ("s-1", "Alice", "student"),
        ("s-2", "Bob", "student"),
        ("s-3", "Carol", "student"),
    ];
    for (i, (id, name, role)) in people.iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-u{}", i),
            "users.create",
            json!({ "caller": admin(), "userId": id, "name": name, "role": role }),
        );
    }
}

/// Baseline lesson.create params: Math with Ms. Wang, Alice and Bob.
pub fn lesson_params(date: &str, start: &str, end: &str) -> serde_json::Value {
    json!({
        "caller": admin(),
        "courseId": "c-math",
        "teacherId": "t-1",
        "studentIds": ["s-1", "s-2"],
        "date": date,
        "startTime": start,
        "endTime": end,
    })
}
