mod test_support;

use serde_json::json;
use test_support::{
    admin, caller, lesson_params, open_workspace, request_err, request_ok, seed_school,
    spawn_sidecar,
};

fn completed_lesson(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        "setup-1",
        "lesson.create",
        lesson_params("2024-06-03", "10:00", "11:00"),
    );
    let lesson_id = created["lessonId"].as_str().expect("lessonId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "setup-2",
        "lesson.complete",
        json!({ "caller": admin(), "id": lesson_id }),
    );
    lesson_id
}

#[test]
fn feedback_requires_completion_and_the_assigned_teacher() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-feedback-rules");
    seed_school(&mut stdin, &mut reader);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "lesson.create",
        lesson_params("2024-06-03", "10:00", "11:00"),
    );
    let lesson_id = created["lessonId"].as_str().expect("lessonId").to_string();

    // Not completed yet.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "feedback.submit",
        json!({ "caller": caller("t-1", "teacher"), "lessonId": lesson_id, "content": "Good focus today." }),
    );
    assert_eq!(error["code"], json!("invalid_state"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "lesson.complete",
        json!({ "caller": admin(), "id": lesson_id }),
    );

    // Wrong teacher.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "feedback.submit",
        json!({ "caller": caller("t-2", "teacher"), "lessonId": lesson_id, "content": "Not my class." }),
    );
    assert_eq!(error["code"], json!("forbidden"));

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "feedback.submit",
        json!({
            "caller": caller("t-1", "teacher"),
            "lessonId": lesson_id,
            "content": "Good focus today.",
            "rating": 4,
        }),
    );
    assert!(submitted["feedbackId"].is_string());

    // One feedback per lesson.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "feedback.submit",
        json!({ "caller": caller("t-1", "teacher"), "lessonId": lesson_id, "content": "Again." }),
    );
    assert_eq!(error["code"], json!("conflict"));
}

#[test]
fn feedback_read_scope_matches_the_lesson() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-feedback-scope");
    seed_school(&mut stdin, &mut reader);
    let lesson_id = completed_lesson(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "feedback.submit",
        json!({ "caller": caller("t-1", "teacher"), "lessonId": lesson_id, "content": "Solid progress.", "rating": 5 }),
    );

    for (i, who) in [caller("admin-1", "admin"), caller("t-1", "teacher"), caller("s-1", "student")]
        .into_iter()
        .enumerate()
    {
        let fetched = request_ok(
            &mut stdin,
            &mut reader,
            &format!("ok-{}", i),
            "feedback.get",
            json!({ "caller": who, "lessonId": lesson_id }),
        );
        assert_eq!(fetched["feedback"]["content"], json!("Solid progress."));
        assert_eq!(fetched["feedback"]["rating"], json!(5));
    }

    let error = request_err(
        &mut stdin,
        &mut reader,
        "deny",
        "feedback.get",
        json!({ "caller": caller("s-3", "student"), "lessonId": lesson_id }),
    );
    assert_eq!(error["code"], json!("forbidden"));
}

#[test]
fn feedback_edit_is_author_only() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, "tutorbook-feedback-edit");
    seed_school(&mut stdin, &mut reader);
    let lesson_id = completed_lesson(&mut stdin, &mut reader);

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "feedback.submit",
        json!({ "caller": caller("t-1", "teacher"), "lessonId": lesson_id, "content": "Draft." }),
    );
    let feedback_id = submitted["feedbackId"].as_str().expect("feedbackId").to_string();

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "feedback.update",
        json!({ "caller": caller("t-2", "teacher"), "id": feedback_id, "content": "Hijacked." }),
    );
    assert_eq!(error["code"], json!("forbidden"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "feedback.update",
        json!({ "caller": caller("t-1", "teacher"), "id": feedback_id, "content": "Final.", "rating": 3 }),
    );
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "feedback.get",
        json!({ "caller": admin(), "lessonId": lesson_id }),
    );
    assert_eq!(fetched["feedback"]["content"], json!("Final."));
    assert_eq!(fetched["feedback"]["rating"], json!(3));

    // Rating bounds.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "feedback.update",
        json!({ "caller": caller("t-1", "teacher"), "id": feedback_id, "rating": 6 }),
    );
    assert_eq!(error["code"], json!("bad_params"));
}
