//! Live-stream tests: a real WebSocket between the publisher fan-out and
//! a consumer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

use skytrail::metrics::Metrics;
use skytrail::publisher::{PublishedFrame, Publisher};
use skytrail::store::StoreCommand;
use skytrail::subscriber::SubscriberClient;
use skytrail::tracker::AircraftSnapshot;

fn sample_row() -> AircraftSnapshot {
    AircraftSnapshot {
        icao: "40058B".to_string(),
        callsign: Some("UAL123".to_string()),
        lat: 49.8176,
        lon: 6.0844,
        alt_ft: Some(39000),
        ground_speed: Some(450.0),
        track_deg: Some(90.0),
        vertical_rate_fpm: Some(0),
        last_seen: 1717243200.0,
    }
}

/// Answers snapshot requests the way the tracker task would.
fn spawn_snapshot_stub(
    rows: Vec<AircraftSnapshot>,
) -> flume::Sender<tokio::sync::oneshot::Sender<Vec<AircraftSnapshot>>> {
    let (tx, rx) = flume::bounded::<tokio::sync::oneshot::Sender<Vec<AircraftSnapshot>>>(16);
    tokio::spawn(async move {
        while let Ok(reply) = rx.recv_async().await {
            let _ = reply.send(rows.clone());
        }
    });
    tx
}

#[tokio::test]
async fn publisher_delivers_frames_in_tick_order() {
    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();

    let publisher = Publisher::bind(0).await.unwrap();
    let addr = publisher.local_addr().unwrap();
    let snapshot_tx = spawn_snapshot_stub(vec![sample_row()]);

    let publisher_task = tokio::spawn(publisher.run(
        Duration::from_millis(50),
        snapshot_tx,
        Arc::clone(&metrics),
        cancel.clone(),
    ));

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    let mut frames: Vec<PublishedFrame> = Vec::new();
    while frames.len() < 3 {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("no stream error");
        if message.is_text() {
            frames.push(serde_json::from_str(message.to_text().unwrap()).unwrap());
        }
    }

    assert!(
        frames.windows(2).all(|pair| pair[0].ts <= pair[1].ts),
        "frames arrive in tick order"
    );
    for frame in &frames {
        assert_eq!(frame.aircraft.len(), 1);
        assert_eq!(frame.aircraft[0].icao, "40058B");
    }

    cancel.cancel();
    let _ = publisher_task.await;
}

#[tokio::test]
async fn subscriber_client_feeds_persistence_queue() {
    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();

    let publisher = Publisher::bind(0).await.unwrap();
    let addr = publisher.local_addr().unwrap();
    let snapshot_tx = spawn_snapshot_stub(vec![sample_row()]);

    let publisher_task = tokio::spawn(publisher.run(
        Duration::from_millis(50),
        snapshot_tx,
        Arc::clone(&metrics),
        cancel.clone(),
    ));

    let (store_tx, store_rx) = flume::bounded::<StoreCommand>(64);
    let client = SubscriberClient::new(
        format!("ws://{addr}"),
        Duration::from_millis(50),
        Arc::clone(&metrics),
    );
    let client_cancel = cancel.clone();
    let client_task = tokio::spawn(async move { client.run(store_tx, client_cancel).await });

    let command = tokio::time::timeout(Duration::from_secs(5), store_rx.recv_async())
        .await
        .expect("sample within timeout")
        .expect("channel open");
    match command {
        StoreCommand::Sample(sample) => {
            assert_eq!(sample.icao, "40058B");
            assert_eq!(sample.velocity, Some(450.0));
            assert_eq!(sample.kind, "airborne");
        }
        other => panic!("expected a sample, got {other:?}"),
    }
    assert!(
        metrics
            .updates_received
            .load(std::sync::atomic::Ordering::Relaxed)
            > 0
    );

    cancel.cancel();
    let _ = client_task.await;
    let _ = publisher_task.await;
}
