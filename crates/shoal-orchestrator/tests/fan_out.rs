//! End-to-end fan-out against a scripted transport.
//!
//! Exercises the full path a console session takes: register hosts,
//! connect, run everywhere, inspect, join a straggler, kill, clear.

use shoal_core::{HostSpec, JobStatus, ShoalConfig, ShoalError};
use shoal_orchestrator::{
    attach, Fleet, HostOutcome, InteractiveBridge, JobDispatcher, JoinOutcome, ESCAPE_BYTE,
};
use shoal_ssh::{MockCommand, MockHost, MockTransport};
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt};

fn transport() -> MockTransport {
    MockTransport::new()
        .with_host(
            "web1",
            MockHost::reachable()
                .with_command("uname", MockCommand::exits(0).with_output("Linux\r\n"))
                .with_command("tail -f app.log", MockCommand::hangs().with_output("booted\r\n")),
        )
        .with_host(
            "web2",
            MockHost::reachable()
                .with_command("uname", MockCommand::exits(0).with_output("Linux\r\n")),
        )
        .with_host("db9", MockHost::unreachable("No route to host"))
}

fn config() -> ShoalConfig {
    ShoalConfig {
        hosts: vec!["web1".into(), "web2".into(), "db9".into()],
        username: Some("ops".into()),
        job_timeout: 0.5,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_console_session_flow() {
    let transport = transport();
    let fleet = Fleet::new(transport.clone(), &config());
    assert_eq!(fleet.connect_all().await, 2);

    let dispatcher = JobDispatcher::new(fleet.clone());
    let report = dispatcher.run_all("uname").await;

    let outcomes: Vec<_> = report
        .outcomes
        .iter()
        .map(|(host, outcome)| (host.as_str().to_string(), outcome.is_success()))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("web1".to_string(), true),
            ("web2".to_string(), true),
            ("db9".to_string(), false),
        ]
    );

    let (_, latest) = fleet.latest_job("web2").unwrap();
    assert_eq!(latest.unwrap().replay(), b"Linux\r\n");

    // A host that comes back is reconnected on the next run
    transport.set_host("db9", MockHost::reachable());
    let record = dispatcher.run_one(&HostSpec::from("db9"), "uname").await.unwrap();
    assert_eq!(record.status(), JobStatus::Exited(0));

    fleet.clear_all_history();
    assert!(fleet.status().iter().all(|(_, status)| status.is_none()));
}

#[tokio::test]
async fn test_join_straggler_then_kill() {
    let fleet = Fleet::new(transport(), &config());
    fleet.set_job_timeout(0.05);
    let dispatcher = JobDispatcher::new(fleet.clone());

    dispatcher.run_one(&HostSpec::from("web2"), "uname").await.unwrap();

    let report = dispatcher.run_all("tail -f app.log").await;
    assert_eq!(report.pending(), vec![HostSpec::from("web1")]);
    assert!(matches!(report.outcomes[2].1, HostOutcome::Failed { .. }));

    // Detach from the straggler, leaving it running
    let bridge = InteractiveBridge::new(fleet.clone());
    let record = bridge.pending_job("web1").unwrap();
    let (mut keyboard, mut input) = duplex(64);
    let (mut output, _screen) = duplex(4096);
    keyboard.write_all(b"hello").await.unwrap();
    keyboard.write_all(&[ESCAPE_BYTE, b'.']).await.unwrap();

    let outcome = attach(&record, &mut input, &mut output).await.unwrap();
    assert_eq!(outcome, JoinOutcome::Detached);
    assert!(record.is_pending());

    // Typed input lands in the stored transcript after the replay
    let transcript = String::from_utf8(record.replay()).unwrap();
    assert!(transcript.starts_with("booted\r\n"));
    assert!(transcript.contains("hello"));

    dispatcher.kill("web1").unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), record.wait())
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Cancelled);

    let err = dispatcher.kill("web1").unwrap_err();
    assert!(matches!(err, ShoalError::NoPendingJob(_)));

    let statuses = fleet.status();
    assert_eq!(statuses[0].1, Some(JobStatus::Cancelled));
    assert_eq!(statuses[1].1, Some(JobStatus::Exited(0)));
    assert_eq!(statuses[2].1, None);
}
