//! Mesh radio end-to-end scenarios on loopback.
//!
//! Every test gets its own synchronisation service ports so the scenarios
//! can run in parallel. The first radio of each pair auto-starts the
//! service; the second finds it already listening.

mod common;

use std::time::Duration;

use microbit_fabric::net::PeerAddress;
use microbit_fabric::{Error, LanRadio, LanRadioOptions, RadioConfig};

use common::wait_until;

fn options(sync_port: u16, data_port: u16, base_port: u16) -> LanRadioOptions {
    LanRadioOptions {
        sync_address: PeerAddress::new("127.0.0.1", sync_port),
        data_address: PeerAddress::new("127.0.0.1", data_port),
        base_port,
        ip: None,
        // No LAN sweep in tests.
        target_ips: Some(Vec::new()),
        interval: Duration::from_millis(100),
        connect_timeout: Some(Duration::from_millis(300)),
    }
}

async fn radio_pair(sync_port: u16, data_port: u16, base_port: u16) -> (LanRadio, LanRadio) {
    let a = LanRadio::new(options(sync_port, data_port, base_port))
        .await
        .unwrap();
    a.on().await.unwrap();
    let b = LanRadio::new(options(sync_port, data_port, base_port))
        .await
        .unwrap();
    b.on().await.unwrap();
    (a, b)
}

async fn wait_connected(a: &LanRadio, b: &LanRadio) {
    assert!(
        wait_until(move || async move { a.peer_count() >= 1 && b.peer_count() >= 1 }).await,
        "radios should discover each other"
    );
}

#[tokio::test]
async fn loopback_delivery_with_matching_tags() {
    let (a, b) = radio_pair(19065, 19066, 19067).await;
    wait_connected(&a, &b).await;

    a.send("hi").await.unwrap();
    let b_ref = &b;
    assert!(
        wait_until(move || async move { b_ref.receive().unwrap() == Some("hi".to_string()) })
            .await,
        "the string should arrive with the envelope stripped"
    );

    // And the raw path carries the metadata.
    a.send_bytes(b"raw").await.unwrap();
    assert!(
        wait_until(move || async move {
            match b_ref.receive_full() {
                Some(entry) => {
                    assert_eq!(entry.message, b"raw");
                    // Default power 6 → (7 − 6) × 8.
                    assert_eq!(entry.rssi, 8);
                    assert!(entry.timestamp_us > 0);
                    true
                }
                None => false,
            }
        })
        .await
    );

    a.off().await;
    b.off().await;
}

#[tokio::test]
async fn tag_mismatch_drops_messages() {
    let (a, b) = radio_pair(19165, 19166, 19167).await;
    b.configure(RadioConfig {
        group: 1,
        ..RadioConfig::default()
    })
    .await
    .unwrap();

    // Give discovery two refresh intervals.
    tokio::time::sleep(Duration::from_millis(400)).await;
    a.send("hi").await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(b.receive_bytes(), None);

    a.off().await;
    b.off().await;
}

#[tokio::test]
async fn full_mailbox_drops_the_newest() {
    let (a, b) = radio_pair(19265, 19266, 19267).await;
    b.configure(RadioConfig {
        queue: 2,
        ..RadioConfig::default()
    })
    .await
    .unwrap();
    wait_connected(&a, &b).await;

    a.send_bytes(b"1").await.unwrap();
    a.send_bytes(b"2").await.unwrap();
    a.send_bytes(b"3").await.unwrap();

    // Let everything propagate before draining, so the third message meets
    // a full mailbox.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(b.receive_bytes(), Some(b"1".to_vec()));
    assert_eq!(b.receive_bytes(), Some(b"2".to_vec()));
    assert_eq!(b.receive_bytes(), None);

    a.off().await;
    b.off().await;
}

#[tokio::test]
async fn oversized_messages_are_rejected_before_any_io() {
    let (a, b) = radio_pair(19365, 19366, 19367).await;
    a.configure(RadioConfig {
        length: 4,
        ..RadioConfig::default()
    })
    .await
    .unwrap();
    wait_connected(&a, &b).await;

    let result = a.send_bytes(b"12345").await;
    assert!(matches!(
        result,
        Err(Error::LengthExceeded { length: 5, max: 4 })
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(b.receive_bytes(), None);

    a.off().await;
    b.off().await;
}

#[tokio::test]
async fn surviving_radio_forgets_a_dead_peer() {
    let (a, b) = radio_pair(19465, 19466, 19467).await;
    wait_connected(&a, &b).await;

    b.off().await;

    // Sending into the void neither raises nor wedges the radio.
    a.send("x").await.unwrap();
    let a_ref = &a;
    assert!(
        wait_until(move || async move {
            a_ref.send("x").await.unwrap();
            a_ref.peer_count() == 0
        })
        .await,
        "the dead peer should be evicted"
    );

    a.off().await;
}

#[tokio::test]
async fn off_state_is_inert() {
    let radio = LanRadio::new(options(19565, 19566, 19567)).await.unwrap();

    radio.send_bytes(b"ignored").await.unwrap();
    radio.send("ignored").await.unwrap();
    assert_eq!(radio.receive_bytes(), None);
    assert_eq!(radio.receive().unwrap(), None);
    assert!(radio.receive_full().is_none());
    assert!(!radio.is_on());
}

#[tokio::test]
async fn port_conflicts_retry_the_next_integer() {
    let (a, b) = radio_pair(19665, 19666, 19667).await;

    assert_eq!(a.local_port(), Some(19667));
    assert_eq!(b.local_port(), Some(19668));

    // off() releases the port for the next on().
    b.off().await;
    assert_eq!(b.local_port(), None);
    let b_ref = &b;
    assert!(
        wait_until(move || async move { b_ref.on().await.is_ok() && b_ref.local_port().is_some() })
            .await
    );

    a.off().await;
    b.off().await;
}

#[tokio::test]
async fn receive_bytes_into_truncates_to_the_buffer() {
    let (a, b) = radio_pair(19765, 19766, 19767).await;
    wait_connected(&a, &b).await;

    a.send_bytes(b"abcdef").await.unwrap();

    let mut buffer = [0u8; 4];
    let mut received = None;
    for _ in 0..100 {
        if let Some(length) = b.receive_bytes_into(&mut buffer) {
            received = Some(length);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(received, Some(6));
    assert_eq!(&buffer, b"abcd");

    a.off().await;
    b.off().await;
}
