mod test_support;

use serde_json::json;
use test_support::{admin, caller, open_workspace, request_err, request_ok, seed_school, spawn_sidecar};

fn enroll(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    id: &str,
    student_id: &str,
    total: i64,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "enrollment.create",
        json!({
            "caller": admin(),
            "studentId": student_id,
            "courseId": "c-math",
            "totalLessons": total,
        }),
    );
    created["enrollmentId"].as_str().expect("enrollmentId").to_string()
}

#[test]
fn one_active_package_per_student_and_course() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-enroll-unique");
    seed_school(&mut stdin, &mut reader);

    let _ = enroll(&mut stdin, &mut reader, "1", "s-1", 10);
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "enrollment.create",
        json!({ "caller": admin(), "studentId": "s-1", "courseId": "c-math", "totalLessons": 5 }),
    );
    assert_eq!(error["code"], json!("conflict"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "enrollment.create",
        json!({ "caller": admin(), "studentId": "s-1", "courseId": "c-math", "totalLessons": 0 }),
    );
    assert_eq!(error["code"], json!("bad_params"));
}

#[test]
fn deduction_walks_the_ledger_to_completed() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-enroll-deduct");
    seed_school(&mut stdin, &mut reader);
    let _ = enroll(&mut stdin, &mut reader, "1", "s-1", 2);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "enrollment.deduct",
        json!({ "caller": admin(), "courseId": "c-math", "studentIds": ["s-1"] }),
    );
    let outcome = &result["outcomes"][0];
    assert_eq!(outcome["deducted"], json!(true));
    assert_eq!(outcome["remainingLessons"], json!(1));
    assert_eq!(outcome["status"], json!("active"));

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "enrollment.deduct",
        json!({ "caller": admin(), "courseId": "c-math", "studentIds": ["s-1"] }),
    );
    let outcome = &result["outcomes"][0];
    assert_eq!(outcome["deducted"], json!(true));
    assert_eq!(outcome["remainingLessons"], json!(0));
    assert_eq!(outcome["status"], json!("completed"));

    // The package is used up: further deductions are non-fatal no-ops.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollment.deduct",
        json!({ "caller": admin(), "courseId": "c-math", "studentIds": ["s-1"] }),
    );
    let outcome = &result["outcomes"][0];
    assert_eq!(outcome["deducted"], json!(false));
    assert_eq!(outcome["reason"], json!("no active enrollment"));
}

#[test]
fn batch_deduction_reports_per_student_outcomes() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-enroll-batch");
    seed_school(&mut stdin, &mut reader);
    let _ = enroll(&mut stdin, &mut reader, "1", "s-1", 10);
    // s-2 has no package at all.

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "enrollment.deduct",
        json!({ "caller": admin(), "courseId": "c-math", "studentIds": ["s-1", "s-2"] }),
    );
    let outcomes = result["outcomes"].as_array().expect("outcomes");
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0]["studentId"], json!("s-1"));
    assert_eq!(outcomes[0]["deducted"], json!(true));
    assert_eq!(outcomes[1]["studentId"], json!("s-2"));
    assert_eq!(outcomes[1]["deducted"], json!(false));
}

#[test]
fn outcome_reports_the_package_it_deducted_from() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-enroll-replacement");
    seed_school(&mut stdin, &mut reader);

    // Deplete a one-lesson package, then buy a replacement right away,
    // so two rows for the pair carry the same updated_at second.
    let old_id = enroll(&mut stdin, &mut reader, "1", "s-1", 1);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "enrollment.deduct",
        json!({ "caller": admin(), "courseId": "c-math", "studentIds": ["s-1"] }),
    );
    let new_id = enroll(&mut stdin, &mut reader, "3", "s-1", 10);
    assert_ne!(old_id, new_id);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollment.deduct",
        json!({ "caller": admin(), "courseId": "c-math", "studentIds": ["s-1"] }),
    );
    let outcome = &result["outcomes"][0];
    assert_eq!(outcome["deducted"], json!(true));
    assert_eq!(outcome["enrollmentId"], json!(new_id));
    assert_eq!(outcome["remainingLessons"], json!(9));
    assert_eq!(outcome["status"], json!("active"));
}

#[test]
fn revise_total_respects_consumed_credits() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-enroll-revise");
    seed_school(&mut stdin, &mut reader);
    let enrollment_id = enroll(&mut stdin, &mut reader, "1", "s-1", 3);

    for i in 0..3 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("d-{}", i),
            "enrollment.deduct",
            json!({ "caller": admin(), "courseId": "c-math", "studentIds": ["s-1"] }),
        );
    }

    // Cannot shrink below what was consumed.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "enrollment.reviseTotal",
        json!({ "caller": admin(), "id": enrollment_id, "newTotal": 2 }),
    );
    assert_eq!(error["code"], json!("invalid_state"));

    // Topping up reactivates the package.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "enrollment.reviseTotal",
        json!({ "caller": admin(), "id": enrollment_id, "newTotal": 5 }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollment.listByStudent",
        json!({ "caller": admin(), "studentId": "s-1" }),
    );
    let entry = &listed["enrollments"][0];
    assert_eq!(entry["totalLessons"], json!(5));
    assert_eq!(entry["usedLessons"], json!(3));
    assert_eq!(entry["remainingLessons"], json!(2));
    assert_eq!(entry["status"], json!("active"));
}

#[test]
fn completion_then_deduction_two_step_flow() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-enroll-two-step");
    seed_school(&mut stdin, &mut reader);
    let _ = enroll(&mut stdin, &mut reader, "1", "s-1", 10);
    let _ = enroll(&mut stdin, &mut reader, "2", "s-2", 10);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "lesson.create",
        json!({
            "caller": admin(),
            "courseId": "c-math",
            "teacherId": "t-1",
            "studentIds": ["s-1", "s-2"],
            "date": "2024-06-03",
            "startTime": "10:00",
            "endTime": "11:00",
        }),
    );
    let lesson_id = created["lessonId"].as_str().expect("lessonId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "lesson.complete",
        json!({ "caller": admin(), "id": lesson_id }),
    );
    // Deduction is an explicit second call with the lesson's students.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollment.deduct",
        json!({ "caller": admin(), "courseId": "c-math", "studentIds": ["s-1", "s-2"] }),
    );
    for outcome in result["outcomes"].as_array().expect("outcomes") {
        assert_eq!(outcome["deducted"], json!(true));
        assert_eq!(outcome["remainingLessons"], json!(9));
    }
}

#[test]
fn enrollment_listing_access_rules() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-enroll-access");
    seed_school(&mut stdin, &mut reader);
    let _ = enroll(&mut stdin, &mut reader, "1", "s-1", 10);

    // Students see their own packages, and only their own.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "enrollment.listByStudent",
        json!({ "caller": caller("s-1", "student") }),
    );
    assert_eq!(listed["enrollments"].as_array().map(|a| a.len()), Some(1));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "enrollment.listByStudent",
        json!({ "caller": caller("s-2", "student"), "studentId": "s-1" }),
    );
    assert_eq!(error["code"], json!("forbidden"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "enrollment.listByStudent",
        json!({ "caller": caller("t-1", "teacher"), "studentId": "s-1" }),
    );
    assert_eq!(error["code"], json!("forbidden"));

    // Admin roster view with pagination metadata.
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollment.list",
        json!({ "caller": admin() }),
    );
    assert_eq!(roster["total"], json!(1));
}
