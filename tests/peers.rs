//! Peer transports: command delivery, listener dispatch, shutdown.

mod common;

use std::sync::Arc;

use microbit_fabric::protocol::command::{Button, MicrobitCommand};
use microbit_fabric::protocol::peer::{ExitStatus, IoPeer, MicrobitPeer, WebsocketPeer};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};

use common::wait_until;

type IoTestPeer = IoPeer<
    BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
>;

fn io_peer_pair() -> (Arc<IoTestPeer>, Arc<IoTestPeer>) {
    let (left, right) = tokio::io::duplex(4096);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        Arc::new(IoPeer::new(BufReader::new(left_read), left_write)),
        Arc::new(IoPeer::new(BufReader::new(right_read), right_write)),
    )
}

#[tokio::test]
async fn io_peer_delivers_commands_in_order() {
    let (sender, receiver) = io_peer_pair();

    let seen: Arc<Mutex<Vec<MicrobitCommand>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        receiver.add_listener(move |command| seen.lock().push(command.clone()));
    }
    let listen = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.listen().await })
    };

    sender.send_command(&MicrobitCommand::Reset).await.unwrap();
    sender
        .send_command(&MicrobitCommand::ButtonIsPressed {
            instance: Button::A,
            is_pressed: true,
        })
        .await
        .unwrap();
    sender
        .send_command(&MicrobitCommand::Temperature { temperature: 20 })
        .await
        .unwrap();

    let seen_ref = &seen;
    assert!(wait_until(move || async move { seen_ref.lock().len() == 3 }).await);
    assert_eq!(seen.lock()[0], MicrobitCommand::Reset);
    assert_eq!(
        seen.lock()[2],
        MicrobitCommand::Temperature { temperature: 20 }
    );

    receiver.stop();
    assert!(listen.await.unwrap().is_ok());
}

#[tokio::test]
async fn io_peer_skips_malformed_lines() {
    let (left, right) = tokio::io::duplex(4096);
    let (left_read, mut raw) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    let receiver = Arc::new(IoPeer::new(BufReader::new(right_read), right_write));
    drop(left_read);

    let seen: Arc<Mutex<Vec<MicrobitCommand>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        receiver.add_listener(move |command| seen.lock().push(command.clone()));
    }
    let listen = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.listen().await })
    };

    raw.write_all(b"this is not json\n").await.unwrap();
    raw.write_all(b"{\"command\":\"microbit.frobnicate\"}\n")
        .await
        .unwrap();
    raw.write_all(b"{\"command\":\"microbit.reset\"}\n")
        .await
        .unwrap();

    let seen_ref = &seen;
    assert!(wait_until(move || async move { seen_ref.lock().len() == 1 }).await);
    assert_eq!(seen.lock()[0], MicrobitCommand::Reset);

    // EOF on the stream closes the peer.
    drop(raw);
    assert!(listen.await.unwrap().is_err());
}

#[tokio::test]
async fn removed_listeners_stop_seeing_commands() {
    let (sender, receiver) = io_peer_pair();

    let seen: Arc<Mutex<Vec<MicrobitCommand>>> = Arc::new(Mutex::new(Vec::new()));
    let id = {
        let seen = seen.clone();
        receiver.add_listener(move |command| seen.lock().push(command.clone()))
    };
    let listen = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.listen().await })
    };

    sender.send_command(&MicrobitCommand::Reset).await.unwrap();
    let seen_ref = &seen;
    assert!(wait_until(move || async move { seen_ref.lock().len() == 1 }).await);

    receiver.remove_listener(id);
    sender.send_command(&MicrobitCommand::Reset).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(seen.lock().len(), 1);

    // An error close is final; further sends fail.
    sender.close(ExitStatus::Error, "giving up").await;
    assert!(sender.send_command(&MicrobitCommand::Reset).await.is_err());
    receiver.stop();
    let _ = listen.await.unwrap();
}

#[tokio::test]
async fn websocket_peer_round_trip_and_clean_close() {
    let accepting =
        tokio::spawn(async move { WebsocketPeer::wait_for_connection("127.0.0.1", 21765).await });
    // Let the listener bind before connecting.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let client = Arc::new(WebsocketPeer::connect("127.0.0.1", 21765).await.unwrap());
    let server = Arc::new(accepting.await.unwrap().unwrap());

    let seen: Arc<Mutex<Vec<MicrobitCommand>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        server.add_listener(move |command| seen.lock().push(command.clone()));
    }
    let server_listen = {
        let server = server.clone();
        tokio::spawn(async move { server.listen().await })
    };

    client
        .send_command(&MicrobitCommand::Sleep { duration: 50 })
        .await
        .unwrap();
    let seen_ref = &seen;
    assert!(wait_until(move || async move { seen_ref.lock().len() == 1 }).await);
    assert_eq!(seen.lock()[0], MicrobitCommand::Sleep { duration: 50 });

    // A normal close (code 1000) ends the remote listen loop cleanly.
    client.close(ExitStatus::Success, "done").await;
    assert!(server_listen.await.unwrap().is_ok());

    // The closed peer is permanently unusable.
    assert!(client
        .send_command(&MicrobitCommand::Reset)
        .await
        .is_err());
}
