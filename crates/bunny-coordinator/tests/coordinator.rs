//! End-to-end coordinator behaviour against an in-memory control plane.

mod support;

use std::time::Duration;

use bunny_client::{ClientError, JobStatus, Model, Role, ServerStatus};
use bunny_coordinator::{
    Coordinator, CoordinatorConfig, DownloadError, ReconcileOutcome, SessionError, SessionOutcome,
    TurnKind,
};
use bytes::Bytes;
use serde_json::json;
use support::{job, sse, FakeControlPlane, StreamScript, PHI_PATH, TINY_PATH};

async fn ready(fake: FakeControlPlane) -> Coordinator<FakeControlPlane> {
    let coordinator = Coordinator::new(fake, CoordinatorConfig::default());
    coordinator.refresh_models().await.unwrap();
    let outcome = coordinator.select_model(Some("tinyllama")).await;
    assert!(matches!(outcome, ReconcileOutcome::Unchanged));
    coordinator.client().clear_calls();
    coordinator
}

fn reply(coordinator: &Coordinator<FakeControlPlane>) -> String {
    let turns = coordinator.transcript();
    turns
        .iter()
        .rev()
        .find(|t| t.role == Role::Assistant)
        .map(|t| t.content.clone())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn test_streamed_hello() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let fake = coordinator.client();
    fake.script_chunks(&[sse("Hel").as_str(), sse("lo").as_str(), "data: [DONE]\n"]);

    let handle = coordinator.send("Hi").unwrap();
    assert_eq!(handle.outcome().await, SessionOutcome::Completed);
    coordinator.wait_idle().await;

    let turns = coordinator.transcript();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "Hi");
    assert_eq!(turns[1].content, "Hello");
    assert_eq!(turns[1].kind, TurnKind::Normal);

    let request = &fake.chat_requests()[0];
    assert_eq!(request.model, "tinyllama");
    assert!(request.stream);
    assert_eq!(request.messages.len(), 2);
    assert_eq!(request.messages[0].role, Role::System);
    assert_eq!(request.messages[1].content, "Hi");

    assert!(!fake.calls().contains(&"POST /chat".to_string()));
    assert_eq!(fake.count("POST /server/start"), 0);
}

#[tokio::test]
async fn test_send_without_model_makes_no_requests() {
    let coordinator = Coordinator::new(FakeControlPlane::new(), CoordinatorConfig::default());

    let err = coordinator.send("Hi").unwrap_err();
    assert_eq!(err, SessionError::NoModelSelected);
    assert!(coordinator.client().calls().is_empty());
    assert!(coordinator.transcript().is_empty());
}

#[tokio::test]
async fn test_send_with_uninstalled_model_makes_no_requests() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let outcome = coordinator.select_model(Some("phi3")).await;
    assert!(matches!(outcome, ReconcileOutcome::Unchanged));
    coordinator.client().clear_calls();

    let err = coordinator.send("Hi").unwrap_err();
    assert_eq!(err, SessionError::ModelNotInstalled("phi3".to_string()));
    assert!(coordinator.client().calls().is_empty());
}

#[tokio::test]
async fn test_regenerate_without_user_turn_is_a_no_op() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;

    let handle = coordinator.regenerate().unwrap();
    assert_eq!(handle.outcome().await, SessionOutcome::NothingToRegenerate);
    assert!(coordinator.transcript().is_empty());
    assert!(coordinator.client().calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_regenerate_replaces_last_reply() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let fake = coordinator.client();
    fake.script_chunks(&[sse("First answer").as_str(), "data: [DONE]\n"]);
    coordinator.send("Hi").unwrap().outcome().await;
    coordinator.wait_idle().await;
    let first_id = coordinator.transcript()[1].id;

    fake.script_chunks(&["Second", " answer"]);
    let outcome = coordinator.regenerate().unwrap().outcome().await;
    assert_eq!(outcome, SessionOutcome::Completed);
    coordinator.wait_idle().await;

    let turns = coordinator.transcript();
    assert_eq!(turns.len(), 2);
    assert_ne!(turns[1].id, first_id);
    assert_eq!(turns[1].content, "Second answer");

    // The replaced reply is not replayed.
    let request = fake.chat_requests().pop().unwrap();
    let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["You are a helpful assistant.", "Hi"]);
}

#[tokio::test(start_paused = true)]
async fn test_no_text_after_cancel() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let tx = coordinator.client().script_channel();

    let handle = coordinator.send("Tell me a story").unwrap();
    tx.send(Ok(Bytes::from(sse("Once")))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reply(&coordinator), "Once");

    tx.send(Ok(Bytes::from(sse(" upon a time there was")))).unwrap();
    assert!(coordinator.cancel());
    let frozen = coordinator.transcript();

    let _ = tx.send(Ok(Bytes::from(sse(" a late token"))));
    tokio::time::sleep(Duration::from_secs(1)).await;
    coordinator.wait_idle().await;

    assert_eq!(coordinator.transcript(), frozen);
    assert_eq!(handle.outcome().await, SessionOutcome::Cancelled);
    assert!(!coordinator.is_generating());
    assert_eq!(coordinator.client().count("POST /generation/cancel"), 1);
    assert!(!coordinator.cancel());
}

#[tokio::test(start_paused = true)]
async fn test_second_send_is_refused_while_busy() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let _tx = coordinator.client().script_channel();

    let handle = coordinator.send("one").unwrap();
    let turns_before = coordinator.transcript().len();
    assert_eq!(coordinator.send("two").unwrap_err(), SessionError::Busy);
    assert_eq!(coordinator.regenerate().unwrap_err(), SessionError::Busy);
    assert_eq!(coordinator.transcript().len(), turns_before);

    coordinator.cancel();
    assert_eq!(handle.outcome().await, SessionOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_empty_stream_falls_back() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let fake = coordinator.client();
    fake.script_chunks(&[
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n",
        "data: [DONE]\n",
    ]);
    fake.script_chat(Ok(json!({
        "choices": [{"message": {"role": "assistant", "content": "From fallback"}}]
    })));

    let outcome = coordinator.send("Hi").unwrap().outcome().await;
    assert_eq!(outcome, SessionOutcome::FellBack);
    coordinator.wait_idle().await;
    assert_eq!(reply(&coordinator), "From fallback");

    let requests = fake.chat_requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[1].stream);
    assert_eq!(requests[1].messages, requests[0].messages);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fallback_becomes_error_turn() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    coordinator.client().script_chat(Err((500, "boom".to_string())));

    let outcome = coordinator.send("Hi").unwrap().outcome().await;
    assert_eq!(outcome, SessionOutcome::Failed("HTTP 500: boom".to_string()));

    let turns = coordinator.transcript();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].kind, TurnKind::Error);
    assert_eq!(turns[1].content, "HTTP 500: boom");
}

#[tokio::test(start_paused = true)]
async fn test_rejected_stream_skips_fallback() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let fake = coordinator.client();
    fake.script_stream(StreamScript::Fail {
        status: 409,
        message: "Different model is currently running".to_string(),
    });

    let outcome = coordinator.send("Hi").unwrap().outcome().await;
    assert!(matches!(outcome, SessionOutcome::Failed(ref m) if m.contains("409")));
    assert!(!fake.calls().contains(&"POST /chat".to_string()));
    assert!(coordinator.transcript()[1].is_error());
}

#[tokio::test(start_paused = true)]
async fn test_broken_stream_keeps_partial_text() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let tx = coordinator.client().script_channel();

    let handle = coordinator.send("Hi").unwrap();
    tx.send(Ok(Bytes::from(sse("partial")))).unwrap();
    tx.send(Err(ClientError::Rejected("connection reset".to_string())))
        .unwrap();

    assert!(matches!(handle.outcome().await, SessionOutcome::Failed(_)));
    coordinator.wait_idle().await;

    let turns = coordinator.transcript();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[1].content, "partial");
    assert!(turns[2].is_error());

    // Error turns are never replayed.
    coordinator.client().script_chunks(&["ok"]);
    coordinator.send("again").unwrap().outcome().await;
    let request = coordinator.client().chat_requests().pop().unwrap();
    assert!(request.messages.iter().all(|m| !m.content.contains("connection reset")));
    assert_eq!(request.messages.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_regenerate_after_broken_stream_leaves_one_reply() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let tx = coordinator.client().script_channel();

    let handle = coordinator.send("Hi").unwrap();
    tx.send(Ok(Bytes::from(sse("partial")))).unwrap();
    tx.send(Err(ClientError::Rejected("connection reset".to_string())))
        .unwrap();
    assert!(matches!(handle.outcome().await, SessionOutcome::Failed(_)));
    coordinator.wait_idle().await;
    assert_eq!(coordinator.transcript().len(), 3);

    coordinator.client().script_chunks(&["fresh"]);
    let outcome = coordinator.regenerate().unwrap().outcome().await;
    assert_eq!(outcome, SessionOutcome::Completed);
    coordinator.wait_idle().await;

    let turns: Vec<(Role, String, bool)> = coordinator
        .transcript()
        .into_iter()
        .map(|t| (t.role, t.content.clone(), t.is_error()))
        .collect();
    assert_eq!(
        turns,
        vec![
            (Role::User, "Hi".to_string(), false),
            (Role::Assistant, "fresh".to_string(), false),
        ]
    );

    let request = coordinator.client().chat_requests().pop().unwrap();
    assert!(request.messages.iter().all(|m| m.content != "partial"));
}

#[tokio::test(start_paused = true)]
async fn test_send_starts_server_after_automatic_start_is_spent() {
    let fake = FakeControlPlane::new();
    fake.set_models(vec![Model::installed("tinyllama", TINY_PATH)]);
    let coordinator = Coordinator::new(fake, CoordinatorConfig::default());
    coordinator.refresh_models().await.unwrap();
    assert!(coordinator.stop_server().await.is_err());
    assert!(matches!(
        coordinator.select_model(Some("tinyllama")).await,
        ReconcileOutcome::AutoStartSpent
    ));
    let fake = coordinator.client();
    fake.clear_calls();

    fake.script_chunks(&["ok"]);
    let outcome = coordinator.send("Hi").unwrap().outcome().await;
    assert_eq!(outcome, SessionOutcome::Completed);
    while fake.count("POST /server/start") == 0 {
        tokio::task::yield_now().await;
    }
    coordinator.wait_idle().await;

    assert_eq!(fake.count("POST /server/start tinyllama"), 1);
    assert_eq!(fake.count("POST /chat/stream"), 1);
    assert_eq!(reply(&coordinator), "ok");
}

#[tokio::test(start_paused = true)]
async fn test_send_streams_when_status_check_fails() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let fake = coordinator.client();
    fake.fail_status(503, "control plane busy");

    fake.script_chunks(&["still", " here"]);
    let outcome = coordinator.send("Hi").unwrap().outcome().await;
    assert_eq!(outcome, SessionOutcome::Completed);
    while fake.count("GET /server/status") == 0 {
        tokio::task::yield_now().await;
    }
    coordinator.wait_idle().await;

    assert_eq!(fake.count("POST /chat/stream"), 1);
    assert_eq!(fake.count("POST /server/start"), 0);
    assert_eq!(reply(&coordinator), "still here");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_selection_wins_on_next_poll() {
    let fake = FakeControlPlane::new();
    fake.set_models(vec![
        Model::installed("tinyllama", TINY_PATH),
        Model::installed("phi3", PHI_PATH),
    ]);
    let release = fake.gate_start();
    let coordinator = Coordinator::new(fake, CoordinatorConfig::default());
    coordinator.refresh_models().await.unwrap();

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.select_model(Some("tinyllama")).await })
    };
    while coordinator.client().count("POST /server/start") == 0 {
        tokio::task::yield_now().await;
    }

    let dropped = coordinator.select_model(Some("phi3")).await;
    assert!(matches!(dropped, ReconcileOutcome::Skipped));
    release.send(()).unwrap();
    assert!(matches!(first.await.unwrap(), ReconcileOutcome::Started));

    let report = coordinator.poll_status().await.unwrap();
    assert!(matches!(report.reconciled, Some(ReconcileOutcome::Restarted)));
    let calls = coordinator.client().calls();
    assert_eq!(calls.last().map(String::as_str), Some("POST /server/start phi3"));

    // The restart changed the observed status once more; after that the
    // server matches and polls change nothing.
    let report = coordinator.poll_status().await.unwrap();
    assert!(matches!(report.reconciled, Some(ReconcileOutcome::Unchanged)));
    let report = coordinator.poll_status().await.unwrap();
    assert_eq!(report.status, ServerStatus {
        running: true,
        pid: Some(4242),
        port: Some(8081),
        model: Some(PHI_PATH.to_string()),
        started_at: None,
    });
    assert!(report.reconciled.is_none());
}

#[tokio::test]
async fn test_installing_selected_model_starts_server() {
    let fake = FakeControlPlane::new();
    fake.set_models(vec![Model::available("tinyllama")]);
    let coordinator = Coordinator::new(fake, CoordinatorConfig::default());
    coordinator.refresh_models().await.unwrap();
    assert!(matches!(
        coordinator.select_model(Some("tinyllama")).await,
        ReconcileOutcome::Unchanged
    ));

    coordinator
        .client()
        .set_models(vec![Model::installed("tinyllama", TINY_PATH)]);
    coordinator.refresh_models().await.unwrap();
    assert_eq!(coordinator.client().count("POST /server/start tinyllama"), 1);
}

#[tokio::test]
async fn test_stop_gives_up_automatic_start() {
    let fake = FakeControlPlane::new();
    fake.set_models(vec![Model::installed("tinyllama", TINY_PATH)]);
    let coordinator = Coordinator::new(fake, CoordinatorConfig::default());
    coordinator.refresh_models().await.unwrap();

    // Nothing is running, so the control plane declines the stop.
    assert!(coordinator.stop_server().await.is_err());
    assert!(matches!(
        coordinator.select_model(Some("tinyllama")).await,
        ReconcileOutcome::AutoStartSpent
    ));
    assert_eq!(coordinator.client().count("POST /server/start"), 0);

    assert!(matches!(coordinator.ensure_server().await, ReconcileOutcome::Started));
}

#[tokio::test]
async fn test_download_lifecycle() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let fake = coordinator.client();

    let job_id = coordinator.start_download("phi3").await.unwrap();
    assert_eq!(job_id, "job-phi3");
    assert!(coordinator.is_downloading("phi3"));

    let mut running = job("job-phi3", "phi3", JobStatus::Running);
    running.downloaded = 10;
    running.size = Some(100);
    fake.set_jobs(vec![running]);
    assert!(coordinator.poll_downloads().await.unwrap().is_empty());
    assert_eq!(coordinator.downloads().len(), 1);

    // Finished server-side: the job disappears and models are refreshed.
    fake.set_jobs(vec![]);
    fake.set_models(vec![
        Model::installed("tinyllama", TINY_PATH),
        Model::installed("phi3", PHI_PATH),
    ]);
    fake.clear_calls();
    let finished = coordinator.poll_downloads().await.unwrap();
    assert_eq!(finished, vec!["phi3".to_string()]);
    assert!(coordinator.downloads().is_empty());
    assert!(fake.calls().contains(&"GET /models".to_string()));
    assert!(coordinator.models().iter().any(|m| m.name == "phi3" && m.installed));
}

#[tokio::test]
async fn test_cancel_download_before_first_poll() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let fake = coordinator.client();

    let job_id = coordinator.start_download("phi3").await.unwrap();
    assert_eq!(coordinator.downloads()[0].status, JobStatus::Queued);

    coordinator.cancel_download("phi3").await.unwrap();
    assert!(fake.calls().contains(&format!("POST /models/pull/cancel {}", job_id)));
    assert!(!coordinator.is_downloading("phi3"));
    assert!(coordinator.downloads().is_empty());
}

#[tokio::test]
async fn test_cancel_download_by_model() {
    let coordinator = ready(FakeControlPlane::with_tinyllama_running()).await;
    let fake = coordinator.client();
    fake.set_jobs(vec![
        job("j0", "phi3", JobStatus::Error),
        job("j1", "phi3", JobStatus::Running),
    ]);
    coordinator.poll_downloads().await.unwrap();

    coordinator.cancel_download("phi3").await.unwrap();
    assert!(fake.calls().contains(&"POST /models/pull/cancel j1".to_string()));
    assert!(!coordinator.is_downloading("phi3"));

    let err = coordinator.cancel_download("phi3").await.unwrap_err();
    assert!(matches!(err, DownloadError::NoActiveJob(ref m) if m == "phi3"));

    let retried = coordinator.retry_download("j0").await.unwrap();
    assert_eq!(retried, "j0-retry");
    assert!(coordinator.is_downloading("phi3"));
}
