//! Synchronisation service end-to-end: orders, ownership reaping, gossip.

mod common;

use std::time::Duration;

use microbit_fabric::net::{Connection, PeerAddress};
use microbit_fabric::sync::{AddressesLinker, SyncClient, SyncServer, SyncServerOptions};

use common::wait_until;

fn options(sync_port: u16, data_port: u16) -> SyncServerOptions {
    SyncServerOptions {
        sync_port,
        data_port,
        ip: None,
        // No LAN sweep in tests.
        target_ips: Some(Vec::new()),
        interval: Duration::from_millis(100),
        connect_timeout: Some(Duration::from_millis(300)),
    }
}

#[tokio::test]
async fn link_get_unlink_through_the_data_port() {
    let server = SyncServer::start(options(18765, 18766)).await.unwrap();

    let client = SyncClient::new(Some(Duration::from_millis(300)));
    client
        .connect(PeerAddress::new("127.0.0.1", 18766))
        .await
        .unwrap();

    client.link_port("channel7group0", 51234).await.unwrap();
    // Orders on one connection are handled in sequence, so the reply to the
    // get already reflects the link.
    assert_eq!(
        client.get_addresses("channel7group0").await.unwrap(),
        vec![PeerAddress::new("127.0.0.1", 51234)]
    );

    // Unknown tags answer with an empty list.
    assert!(client.get_addresses("channel0group0").await.unwrap().is_empty());

    // Relinking replaces the connection's entry rather than adding one.
    client.link_port("channel3group1", 51234).await.unwrap();
    assert!(client.get_addresses("channel7group0").await.unwrap().is_empty());
    assert_eq!(
        client.get_addresses("channel3group1").await.unwrap(),
        vec![PeerAddress::new("127.0.0.1", 51234)]
    );

    client.unlink_port(51234).await.unwrap();
    let server_ref = &server;
    assert!(
        wait_until(move || async move { server_ref.linker().is_empty() }).await,
        "unlink should empty the registry"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn dead_client_entries_are_reaped() {
    let server = SyncServer::start(options(18865, 18866)).await.unwrap();

    let client = SyncClient::new(Some(Duration::from_millis(300)));
    client
        .connect(PeerAddress::new("127.0.0.1", 18866))
        .await
        .unwrap();
    client.link_port("channel7group0", 51235).await.unwrap();

    let server_ref = &server;
    assert!(wait_until(move || async move { server_ref.linker().len() == 1 }).await);

    client.disconnect().await;
    assert!(
        wait_until(move || async move { server_ref.linker().is_empty() }).await,
        "the owned entry should be unlinked on disconnect"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn gossip_merges_a_remote_linker() {
    let server = SyncServer::start(options(18965, 18966)).await.unwrap();

    // Pose as a peer synchronisation server on the sync port.
    let connection = Connection::connect(
        &PeerAddress::new("127.0.0.1", 18965),
        Some(Duration::from_millis(300)),
    )
    .await
    .unwrap();

    let ours = AddressesLinker::new();
    ours.link(PeerAddress::new("10.0.0.9", 4321), "channel7group0");

    // Symmetric exchange: both sides send first, then receive and merge.
    connection.send(ours.to_json().as_bytes()).await.unwrap();
    let first = connection.recv().await.unwrap();
    let theirs = AddressesLinker::from_json(&String::from_utf8_lossy(&first)).unwrap();
    assert!(theirs.is_empty(), "the server starts with an empty linker");

    let server_ref = &server;
    assert!(
        wait_until(move || async move {
            server_ref
                .linker()
                .snapshot()
                .contains_key(&PeerAddress::new("10.0.0.9", 4321))
        })
        .await,
        "our entry should be merged into the server's linker"
    );

    // The next round echoes the merged entry back to us.
    connection.send(ours.to_json().as_bytes()).await.unwrap();
    let second = connection.recv().await.unwrap();
    let merged = AddressesLinker::from_json(&String::from_utf8_lossy(&second)).unwrap();
    assert!(merged
        .snapshot()
        .contains_key(&PeerAddress::new("10.0.0.9", 4321)));

    connection.close().await;
    server.shutdown().await;
}
