//! Bus integration tests over loopback sockets.

use std::time::Duration;

use bytes::Bytes;
use chrono::TimeZone;
use signalk_bus::{run_filter, Publisher, Subscriber};
use signalk_core::{Delta, PathValue, RateLimitConfig, RateLimitFilter, Source, Update};
use signalk_protocol::codec::encode_delta;
use signalk_protocol::RawStamper;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn bound_publisher() -> (Publisher, String) {
    let publisher = Publisher::bind("tcp://127.0.0.1:0", 100).await.unwrap();
    let url = format!("tcp://{}", publisher.local_addr().unwrap());
    (publisher, url)
}

async fn wait_for_subscribers(publisher: &Publisher, n: usize) {
    timeout(WAIT, async {
        while publisher.subscriber_count() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscribers did not attach");
}

fn delta_at(millis: i64) -> Delta {
    Delta::single(
        "vessels/x",
        Update {
            source: Source::new("test", "nmea0183"),
            timestamp: chrono::Utc
                .timestamp_millis_opt(1_700_000_000_000 + millis)
                .unwrap(),
            values: vec![
                PathValue {
                    path: "navigation.speedOverGround".to_string(),
                    value: serde_json::json!(3.6),
                },
                PathValue {
                    path: "navigation.headingTrue".to_string(),
                    value: serde_json::json!(1.2),
                },
            ],
        },
    )
}

#[tokio::test]
async fn test_tcp_fan_out_preserves_order() {
    let (publisher, url) = bound_publisher().await;
    let a = Subscriber::connect(&[url.clone()], 100).unwrap();
    let b = Subscriber::connect(&[url], 100).unwrap();
    wait_for_subscribers(&publisher, 2).await;

    for i in 0..10u8 {
        publisher.publish(Bytes::from(vec![i + 1])).unwrap();
    }

    for sub in [&a, &b] {
        for i in 0..10u8 {
            let msg = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
            assert_eq!(msg, Bytes::from(vec![i + 1]));
        }
    }
}

#[tokio::test]
async fn test_close_propagates_end_of_stream() {
    let (publisher, url) = bound_publisher().await;
    let sub = Subscriber::connect(&[url], 100).unwrap();
    wait_for_subscribers(&publisher, 1).await;

    publisher.publish(Bytes::from_static(b"last")).unwrap();
    publisher.close();

    assert_eq!(
        timeout(WAIT, sub.recv()).await.unwrap(),
        Some(Bytes::from_static(b"last"))
    );
    assert_eq!(timeout(WAIT, sub.recv()).await.unwrap(), None);
    assert!(publisher.publish(Bytes::from_static(b"x")).is_err());
}

#[tokio::test]
async fn test_raw_envelopes_cross_the_bus() {
    let (publisher, url) = bound_publisher().await;
    let sub = Subscriber::connect(&[url], 100).unwrap();
    wait_for_subscribers(&publisher, 1).await;

    let mut stamper = RawStamper::new("gps", "nmea0183");
    let raw = stamper.stamp(&b"$GPHDT,10.0,T*00"[..]).unwrap();
    publisher.publish(raw.encode().unwrap()).unwrap();
    // garbage is skipped by the typed receiver
    publisher.publish(Bytes::from_static(b"\x09junk")).unwrap();
    let raw2 = stamper.stamp(&b"$GPHDT,11.0,T*00"[..]).unwrap();
    publisher.publish(raw2.encode().unwrap()).unwrap();

    assert_eq!(timeout(WAIT, sub.recv_raw()).await.unwrap(), Some(raw));
    assert_eq!(timeout(WAIT, sub.recv_raw()).await.unwrap(), Some(raw2));
}

#[tokio::test]
async fn test_subscriber_reconnects_after_publisher_restart() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = format!("tcp://{addr}");

    let sub = Subscriber::connect_with(&[url.clone()], 100, Duration::from_millis(50)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let publisher = Publisher::bind(&url, 100).await.unwrap();
    wait_for_subscribers(&publisher, 1).await;
    publisher.publish(Bytes::from_static(b"late")).unwrap();

    assert_eq!(
        timeout(WAIT, sub.recv()).await.unwrap(),
        Some(Bytes::from_static(b"late"))
    );
}

#[tokio::test]
async fn test_local_queue_drops_oldest() {
    let publisher = Publisher::new(2);
    let sub = publisher.subscribe();
    for i in 1..=4u8 {
        publisher.publish(Bytes::from(vec![i])).unwrap();
    }
    assert_eq!(publisher.dropped(), 2);
    assert_eq!(sub.recv().await, Some(Bytes::from(vec![3])));
    assert_eq!(sub.recv().await, Some(Bytes::from(vec![4])));
}

#[tokio::test]
async fn test_filter_stage_thins_deltas() {
    let input = Publisher::new(100);
    let output = Publisher::new(100);
    let input_sub = input.subscribe();
    let output_sub = output.subscribe();

    let stage = tokio::spawn(run_filter(
        input_sub,
        output.clone(),
        RateLimitFilter::new(RateLimitConfig::default()),
    ));

    for ms in [0, 500, 1100] {
        input
            .publish(Bytes::from(encode_delta(&delta_at(ms)).unwrap()))
            .unwrap();
    }
    input.close();

    let stats = timeout(WAIT, stage).await.unwrap().unwrap();
    assert_eq!(stats.forwarded, 2);
    assert_eq!(stats.suppressed, 1);

    let first = output_sub.recv_delta().await.unwrap();
    let second = output_sub.recv_delta().await.unwrap();
    assert_eq!(first, delta_at(0));
    assert_eq!(second, delta_at(1100));
    assert_eq!(output_sub.recv().await, None);
}
