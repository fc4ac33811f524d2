//! End-to-end lifecycle scenarios driven through the mock seams, with the
//! exact outbound message sequences asserted.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use testgrid_worker_eventbus::STATUS_CHANGED;
use testgrid_worker_lifecycle::job::Job;
use testgrid_worker_lifecycle::pool::{AUTOINST_LOG_FILE, TEST_ORDER_FILE, TEST_RESULTS_DIR, WORKER_LOG_FILE};
use testgrid_worker_lifecycle::test_support::{
    wait_for_status, wait_until, JobFixture, MockEngine, RecordedRequest,
};
use testgrid_worker_protocol::client::ApiMethod;
use testgrid_worker_protocol::error::WorkerError;
use testgrid_worker_protocol::job::StopReason;
use testgrid_worker_protocol::status::JobStatus;

fn record_status_changes(job: &Job) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    job.events().on(STATUS_CHANGED, move |payload| {
        if let Some(status) = payload["status"].as_str() {
            sink.lock().expect("status record lock").push(status.to_owned());
        }
    });
    seen
}

fn paths_of(requests: &[RecordedRequest]) -> Vec<String> {
    requests.iter().map(|request| request.path.clone()).collect()
}

#[tokio::test]
async fn accepted_job_survives_a_websocket_drop() {
    let fixture = JobFixture::new(Some(1), MockEngine::succeeding());

    fixture.job.accept().await.expect("accept job");
    assert_eq!(fixture.job.status(), JobStatus::Accepted);

    fixture.job.handle_websocket_finish();
    assert_eq!(fixture.job.status(), JobStatus::Accepted);

    assert_eq!(
        fixture.client.status_messages(),
        vec![json!({"jobid": 1, "type": "accepted"})]
    );
    assert!(fixture.client.rest_requests().is_empty());
}

#[tokio::test]
async fn a_websocket_drop_before_the_ack_abandons_the_job() {
    // The finish signal lands while the acceptance ack is in flight.
    let fixture = JobFixture::new(Some(2), MockEngine::succeeding());
    let gate = fixture.client.gate_next_status();

    let accepting = {
        let job = fixture.job.clone();
        tokio::spawn(async move { job.accept().await })
    };
    let client = Arc::clone(&fixture.client);
    wait_until("the acceptance frame went out", move || {
        !client.status_messages().is_empty()
    })
    .await;
    assert_eq!(fixture.job.status(), JobStatus::Accepting);

    fixture.job.handle_websocket_finish();
    assert_eq!(fixture.job.status(), JobStatus::Stopped);
    assert_eq!(fixture.job.stop_reason(), Some(StopReason::Abandoned));

    drop(gate);
    accepting
        .await
        .expect("join accept task")
        .expect("the delayed ack itself still goes through");
    assert_eq!(fixture.job.status(), JobStatus::Stopped);

    let error = fixture.job.start().await.expect_err("start must fail");
    match error {
        WorkerError::InvalidState(message) => {
            assert_eq!(message, "attempt to start job which is not accepted");
        }
        other => panic!("expected an invalid-state error, got {other:?}"),
    }
    assert_eq!(
        fixture.client.status_messages(),
        vec![json!({"jobid": 2, "type": "accepted"})]
    );
}

#[tokio::test]
async fn starting_without_an_id_produces_no_network_traffic() {
    let fixture = JobFixture::new(None, MockEngine::succeeding());

    let error = fixture.job.start().await.expect_err("start must fail");
    assert!(matches!(error, WorkerError::MissingJobId));
    assert_eq!(
        error.to_string(),
        "attempt to start job without ID and job info"
    );

    assert!(fixture.client.rest_requests().is_empty());
    assert!(fixture.client.status_messages().is_empty());
    assert_eq!(fixture.job.status(), JobStatus::New);
}

#[tokio::test]
async fn a_setup_error_cleans_the_pool_and_reports_completion() {
    let fixture = JobFixture::new(Some(3), MockEngine::failing("this is not a real isotovideo"));
    std::fs::write(fixture.pool_root.join(AUTOINST_LOG_FILE), "stale").expect("seed stale log");
    let results = fixture.pool_root.join(TEST_RESULTS_DIR);
    std::fs::create_dir_all(&results).expect("seed testresults");
    std::fs::write(results.join(TEST_ORDER_FILE), "[]").expect("seed test order");

    fixture.job.accept().await.expect("accept job");
    fixture.job.start().await.expect("start reports setup errors via the stop path");
    wait_for_status(&fixture.job, JobStatus::Stopped).await;

    assert_eq!(
        fixture.job.setup_error().as_deref(),
        Some("this is not a real isotovideo")
    );
    assert_eq!(fixture.job.stop_reason(), Some(StopReason::SetupFailure));
    assert!(!fixture.pool_root.join(AUTOINST_LOG_FILE).exists());
    assert!(fixture.pool_root.join(WORKER_LOG_FILE).exists());

    let requests = fixture.client.rest_requests();
    assert_eq!(
        paths_of(&requests),
        vec!["jobs/3/status", "jobs/3/status", "jobs/3/set_done"]
    );
    assert!(requests
        .iter()
        .all(|request| request.method == ApiMethod::Post));
    assert_eq!(
        requests[0].body,
        json!({"status": {"uploading": 1, "worker_id": 42}})
    );
    assert_eq!(
        requests[1].body,
        json!({"status": {
            "backend": "qemu",
            "cmd_srv_url": "http://127.0.0.1:20013",
            "result": {},
            "test_execution_paused": 0,
            "test_order": [],
            "worker_hostname": "grid-7",
            "worker_id": 42,
            "setup_error": "this is not a real isotovideo",
        }})
    );
    assert_eq!(requests[2].body, Value::Null);
}

#[tokio::test]
async fn a_successful_job_walks_the_full_status_sequence() {
    let fixture = JobFixture::new(Some(4), MockEngine::succeeding());
    let statuses = record_status_changes(&fixture.job);

    fixture.job.accept().await.expect("accept job");
    fixture.job.start().await.expect("start job");
    assert_eq!(fixture.job.status(), JobStatus::Running);

    fixture.job.begin_uploading_results();
    fixture.job.conclude_uploading_results();
    wait_for_status(&fixture.job, JobStatus::Stopped).await;
    assert_eq!(fixture.job.stop_reason(), Some(StopReason::Done));

    assert_eq!(
        *statuses.lock().expect("status record lock"),
        vec!["accepting", "accepted", "setup", "running", "stopping", "stopped"]
    );

    let requests = fixture.client.rest_requests();
    assert_eq!(
        paths_of(&requests),
        vec![
            "jobs/4/status",
            "jobs/4/status",
            "jobs/4/status",
            "jobs/4/set_done",
        ]
    );
    assert_eq!(
        requests[0].body,
        json!({"status": {
            "cmd_srv_url": "http://127.0.0.1:20013",
            "test_execution_paused": 0,
            "worker_hostname": "grid-7",
            "worker_id": 42,
        }})
    );
    assert_eq!(requests[1].body["status"]["uploading"], json!(1));
    assert_eq!(requests[2].body["status"]["result"], json!({}));
    assert_eq!(requests[3].body, Value::Null);
}

#[tokio::test]
async fn livelog_adds_the_progress_post_to_the_stop_sequence() {
    // Same status walk as the plain success path, plus the livelog side channel.
    let fixture = JobFixture::new(Some(6), MockEngine::succeeding());
    let statuses = record_status_changes(&fixture.job);

    fixture.job.accept().await.expect("accept job");
    fixture.job.start().await.expect("start job");

    fixture.job.set_developer_session(true);
    assert!(fixture.job.developer_session_running());
    fixture.job.start_livelog().expect("start livelog");
    assert_eq!(fixture.job.livelog_viewers(), 1);

    fixture.job.begin_uploading_results();
    fixture.job.conclude_uploading_results();
    wait_for_status(&fixture.job, JobStatus::Stopped).await;

    fixture.job.stop_livelog().expect("stop livelog");
    assert_eq!(fixture.job.livelog_viewers(), 0);

    assert_eq!(
        *statuses.lock().expect("status record lock"),
        vec!["accepting", "accepted", "setup", "running", "stopping", "stopped"]
    );

    let requests = fixture.client.rest_requests();
    assert_eq!(
        paths_of(&requests),
        vec![
            "jobs/6/status",
            "/liveviewhandler/api/v1/jobs/6/upload_progress",
            "jobs/6/status",
            "jobs/6/status",
            "jobs/6/set_done",
        ]
    );
    // The progress snapshot precedes the upload marker.
    assert_eq!(
        requests[1].body,
        json!({
            "outstanding_files": 0,
            "outstanding_images": 0,
            "upload_up_to": null,
            "upload_up_to_current_module": null,
        })
    );
    assert_eq!(requests[2].body["status"]["uploading"], json!(1));
}

#[tokio::test]
async fn exactly_one_acceptance_frame_per_job() {
    // Every job reaching `accepting` or later announced itself exactly once.
    let fixture = JobFixture::new(Some(7), MockEngine::succeeding());
    fixture.job.accept().await.expect("accept job");
    fixture.job.start().await.expect("start job");
    fixture.job.begin_uploading_results();
    fixture.job.conclude_uploading_results();
    wait_for_status(&fixture.job, JobStatus::Stopped).await;

    let acceptance_frames = fixture
        .client
        .status_messages()
        .iter()
        .filter(|frame| frame["type"] == json!("accepted"))
        .count();
    assert_eq!(acceptance_frames, 1);
}

#[tokio::test]
async fn set_done_is_the_last_message_of_every_stopped_job() {
    // Checked on the died path for variety.
    let engine = MockEngine::succeeding();
    let fixture = JobFixture::new(Some(8), Arc::clone(&engine));
    fixture.job.accept().await.expect("accept job");
    fixture.job.start().await.expect("start job");

    engine.exit_with(Some(130));
    wait_for_status(&fixture.job, JobStatus::Stopped).await;

    let requests = fixture.client.rest_requests();
    let last = requests.last().expect("at least one request");
    assert_eq!(last.path, "jobs/8/set_done");
    assert_eq!(last.body, Value::Null);
}

#[tokio::test]
async fn the_engine_sees_the_job_settings_and_the_pool_directory() {
    let engine = MockEngine::succeeding();
    let fixture = JobFixture::new(Some(9), Arc::clone(&engine));
    fixture.job.accept().await.expect("accept job");
    fixture.job.start().await.expect("start job");

    let spawns = engine.spawn_requests();
    assert_eq!(spawns.len(), 1);
    assert_eq!(spawns[0].job_id, 9);
    assert_eq!(spawns[0].settings["BACKEND"], json!("qemu"));
    assert_eq!(spawns[0].pool_directory, fixture.pool_root);

    fixture.job.stop(StopReason::Done).await;
    wait_for_status(&fixture.job, JobStatus::Stopped).await;
}
