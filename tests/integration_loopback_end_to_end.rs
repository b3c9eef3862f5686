use anyhow::Result;
use pubperf::protocol::COMPLETE_SIZE;
use pubperf::publisher::PublishHandler;
use pubperf::scenario::Scenario;
use pubperf::subscriber::SubscribeHandler;
use pubperf::transport::{LoopbackRelay, RelayClient};
use std::time::Duration;

const SCENARIO: &str = r#"{
    "e2e": {
        "namespace": "perf/{}/e2e",
        "name": "track0",
        "delivery_mode": "stream",
        "priority": 1,
        "ttl": 100,
        "transmit_interval": 0.005,
        "objects_per_group": 5,
        "first_object_size": 256,
        "object_size": 128,
        "start_delay": 0,
        "total_transmit_time": 300
    }
}"#;

async fn wait_for_completion(sub: &SubscribeHandler) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !sub.is_complete() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscriber observed the completion record");
}

/// Drive a full publish/subscribe lifecycle through the loopback relay and
/// cross-check the subscriber's summary against the publisher's totals.
#[tokio::test]
async fn full_lifecycle_through_the_loopback_relay() -> Result<()> {
    let relay = LoopbackRelay::new(Duration::from_millis(50));
    let scenario = Scenario::from_json(SCENARIO)?;
    let config = scenario.configs_for_instance(1001).remove(0);
    assert_eq!(config.channel.namespace, "perf/1001/e2e");

    let sub = SubscribeHandler::new(config.clone(), 1001)?;
    relay.subscribe_track(sub.channel(), sub.clone()).await?;

    let publisher_handler = PublishHandler::new(config.clone());
    let publisher = relay
        .publish_track(
            publisher_handler.channel(),
            config.delivery_mode,
            publisher_handler.clone(),
        )
        .await?;
    let writer = tokio::spawn(publisher_handler.clone().run_writer(publisher));

    wait_for_completion(&sub).await;
    writer.await?;
    assert!(publisher_handler.is_finished());

    let pub_report = publisher_handler.report();
    let sub_report = sub.report().expect("completion summary");

    // A 300 ms window at 5 ms per object publishes a healthy batch plus the
    // completion record.
    assert!(pub_report.total_published_objects > 10);
    assert!(pub_report.start_transmit_time_us > 0);
    assert!(pub_report.end_transmit_time_us >= pub_report.start_transmit_time_us);

    assert_eq!(sub_report.published_objects, pub_report.total_published_objects);
    assert_eq!(sub_report.published_bytes, pub_report.total_published_bytes);

    // Loopback delivery is lossless; the only gap between the producer's
    // claim and the received data tally is the completion record itself.
    assert_eq!(sub_report.object_delta, 1);
    assert_eq!(sub_report.byte_delta, COMPLETE_SIZE as i64);
    assert_eq!(
        sub_report.received_objects,
        pub_report.total_published_objects - 1
    );

    assert!(sub_report.transmit_delta_us.max >= sub_report.transmit_delta_us.min);
    assert!(sub_report.arrival_delta_us.max > 0);

    relay.disconnect().await;
    Ok(())
}

/// With a zero transmit window the producer publishes nothing but the
/// completion record and still finishes cleanly.
#[tokio::test]
async fn zero_transmit_time_publishes_only_the_completion_record() -> Result<()> {
    let scenario = Scenario::from_json(
        r#"{
            "degenerate": {
                "namespace": "perf/{}/degenerate",
                "name": "track0",
                "objects_per_group": 5,
                "transmit_interval": 0.0,
                "total_transmit_time": 0
            }
        }"#,
    )?;
    let config = scenario.configs_for_instance(1001).remove(0);

    let relay = LoopbackRelay::new(Duration::from_millis(50));
    let sub = SubscribeHandler::new(config.clone(), 1001)?;
    relay.subscribe_track(sub.channel(), sub.clone()).await?;

    let publisher_handler = PublishHandler::new(config.clone());
    let publisher = relay
        .publish_track(
            publisher_handler.channel(),
            config.delivery_mode,
            publisher_handler.clone(),
        )
        .await?;
    tokio::spawn(publisher_handler.clone().run_writer(publisher)).await?;

    wait_for_completion(&sub).await;

    let pub_report = publisher_handler.report();
    assert_eq!(pub_report.total_published_objects, 1);
    assert_eq!(pub_report.total_published_bytes, COMPLETE_SIZE as u64);

    let sub_report = sub.report().expect("completion summary");
    assert_eq!(sub_report.received_objects, 0);
    assert_eq!(sub_report.published_objects, 1);
    assert_eq!(sub_report.object_delta, 1);
    assert_eq!(sub_report.elapsed_us, 0);
    assert_eq!(sub_report.transmit_delta_us.avg, 0.0);

    relay.disconnect().await;
    Ok(())
}
