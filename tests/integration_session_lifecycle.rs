use anyhow::Result;
use pubperf::cli::Role;
use pubperf::scenario::Scenario;
use pubperf::session::{PerfSession, SessionSettings, ShutdownToken};
use pubperf::transport::LoopbackRelay;
use std::sync::Arc;
use std::time::Duration;

fn settings(role: Role) -> SessionSettings {
    SessionSettings {
        role,
        endpoint_id: "test@localhost".to_string(),
        conference_id: 1,
        instance_id: 1,
        instances: 1,
    }
}

/// A single-instance `both` session publishes and reads back its own
/// channels through the loopback relay, then tears down cleanly.
#[tokio::test]
async fn session_runs_to_completion() -> Result<()> {
    let scenario = Scenario::from_json(
        r#"{
            "short": {
                "namespace": "perf/{}/short",
                "name": "track0",
                "delivery_mode": "stream",
                "priority": 1,
                "ttl": 100,
                "transmit_interval": 0.005,
                "objects_per_group": 4,
                "first_object_size": 200,
                "object_size": 100,
                "start_delay": 0,
                "total_transmit_time": 200
            }
        }"#,
    )?;

    let relay = Arc::new(LoopbackRelay::new(Duration::from_millis(50)));
    let session = PerfSession::new(relay, scenario, settings(Role::Both), ShutdownToken::new());

    let (publishers, subscribers) =
        tokio::time::timeout(Duration::from_secs(15), session.run()).await??;

    assert_eq!(publishers.len(), 1);
    assert_eq!(subscribers.len(), 1);
    assert_eq!(
        subscribers[0].published_objects,
        publishers[0].total_published_objects
    );
    Ok(())
}

/// Triggering the shutdown token ends a long run early without an error;
/// unfinished channels simply have no completion summary.
#[tokio::test]
async fn shutdown_token_stops_a_long_run() -> Result<()> {
    let scenario = Scenario::from_json(
        r#"{
            "long": {
                "namespace": "perf/{}/long",
                "name": "track0",
                "transmit_interval": 0.01,
                "objects_per_group": 10,
                "first_object_size": 100,
                "object_size": 100,
                "total_transmit_time": 60000
            }
        }"#,
    )?;

    let relay = Arc::new(LoopbackRelay::new(Duration::from_millis(50)));
    let shutdown = ShutdownToken::new();
    let session = PerfSession::new(relay, scenario, settings(Role::Both), shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.trigger();
        });
    }

    let (publishers, subscribers) =
        tokio::time::timeout(Duration::from_secs(10), session.run()).await??;

    assert_eq!(publishers.len(), 1);
    assert!(subscribers.is_empty());
    Ok(())
}

/// A publish-only role builds no subscribe handlers.
#[tokio::test]
async fn publisher_role_has_no_subscribers() -> Result<()> {
    let scenario = Scenario::from_json(
        r#"{
            "pub-only": {
                "namespace": "perf/{}/pub-only",
                "name": "track0",
                "transmit_interval": 0.005,
                "objects_per_group": 4,
                "object_size": 100,
                "total_transmit_time": 100
            }
        }"#,
    )?;

    let relay = Arc::new(LoopbackRelay::new(Duration::from_millis(50)));
    let session = PerfSession::new(
        relay,
        scenario,
        settings(Role::Publisher),
        ShutdownToken::new(),
    );

    let (publishers, subscribers) =
        tokio::time::timeout(Duration::from_secs(15), session.run()).await??;

    assert_eq!(publishers.len(), 1);
    assert!(subscribers.is_empty());
    assert!(publishers[0].total_published_objects > 0);
    Ok(())
}
