//! End-to-end tests driving real sockets against running servers.
//!
//! Each test binds its own fixed port so the suite can run in parallel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use replication::{Primary, Replica};
use server::{Role, Server};
use storage::Store;

type Reader = BufReader<OwnedReadHalf>;

async fn start_primary(port: u16) -> (Store, Arc<Primary>) {
    let store = Store::new();
    let primary = Arc::new(Primary::new());
    let server = Server::new(port, store.clone(), Role::Primary(Arc::clone(&primary)));
    tokio::spawn(async move { server.run().await.unwrap() });
    (store, primary)
}

async fn start_replica(port: u16, primary_port: u16) -> Store {
    let store = Store::new();
    let replica = Replica::new(store.clone(), port, "127.0.0.1".to_string(), primary_port);
    tokio::spawn(async move { replica.run().await });
    let server = Server::new(port, store.clone(), Role::Replica);
    tokio::spawn(async move { server.run().await.unwrap() });
    store
}

async fn connect(port: u16) -> (Reader, OwnedWriteHalf) {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            let (reader, writer) = stream.into_split();
            return (BufReader::new(reader), writer);
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("server on port {} did not come up", port);
}

async fn send(writer: &mut OwnedWriteHalf, argv: &[&str]) {
    writer
        .write_all(protocol::encode_array(argv).as_bytes())
        .await
        .unwrap();
}

async fn read_reply_line(reader: &mut Reader) -> String {
    timeout(Duration::from_secs(5), protocol::read_line(reader))
        .await
        .expect("timed out waiting for reply")
        .unwrap()
}

/// Read a bulk reply; `None` for the null bulk.
async fn read_bulk(reader: &mut Reader) -> Option<String> {
    let header = read_reply_line(reader).await;
    if header == "$-1" {
        return None;
    }
    let len: usize = header.strip_prefix('$').unwrap().parse().unwrap();
    let mut buf = vec![0u8; len + 2];
    reader.read_exact(&mut buf).await.unwrap();
    buf.truncate(len);
    Some(String::from_utf8(buf).unwrap())
}

#[tokio::test]
async fn test_ping_echo_and_errors() {
    start_primary(17001).await;
    let (mut reader, mut writer) = connect(17001).await;

    send(&mut writer, &["PING"]).await;
    assert_eq!(read_reply_line(&mut reader).await, "+PONG");

    // Verb matching is case-insensitive.
    send(&mut writer, &["ping"]).await;
    assert_eq!(read_reply_line(&mut reader).await, "+PONG");

    send(&mut writer, &["ECHO", "hello"]).await;
    assert_eq!(read_bulk(&mut reader).await, Some("hello".to_string()));

    send(&mut writer, &["ECHO"]).await;
    assert_eq!(
        read_reply_line(&mut reader).await,
        "-ERR wrong number of arguments for 'echo' command"
    );

    send(&mut writer, &["FLY", "me"]).await;
    assert_eq!(read_reply_line(&mut reader).await, "-ERR unknown command 'FLY'");

    send(&mut writer, &["SET", "k", "v", "PX", "soon"]).await;
    assert_eq!(read_reply_line(&mut reader).await, "-ERR invalid PX value");
}

#[tokio::test]
async fn test_set_get_with_expiry() {
    start_primary(17002).await;
    let (mut reader, mut writer) = connect(17002).await;

    send(&mut writer, &["SET", "k", "v", "PX", "100"]).await;
    assert_eq!(read_reply_line(&mut reader).await, "+OK");

    send(&mut writer, &["GET", "k"]).await;
    assert_eq!(read_bulk(&mut reader).await, Some("v".to_string()));

    sleep(Duration::from_millis(150)).await;
    send(&mut writer, &["GET", "k"]).await;
    assert_eq!(read_bulk(&mut reader).await, None);
}

#[tokio::test]
async fn test_info_reports_role() {
    let (_, primary) = start_primary(17003).await;
    let (mut reader, mut writer) = connect(17003).await;

    send(&mut writer, &["INFO"]).await;
    let payload = read_bulk(&mut reader).await.unwrap();
    assert!(payload.contains("role:leader\n"));
    assert!(payload.contains(&format!("leader_replid:{}\n", primary.repl_id())));
    assert!(payload.contains("leader_repl_offset:0\n"));
}

#[tokio::test]
async fn test_wait_without_writes_returns_follower_count() {
    start_primary(17004).await;
    let (mut reader, mut writer) = connect(17004).await;

    let started = Instant::now();
    send(&mut writer, &["WAIT", "0", "1000"]).await;
    assert_eq!(read_reply_line(&mut reader).await, ":0");
    assert!(started.elapsed() < Duration::from_millis(500));
}

async fn wait_for_replica_count(primary: &Arc<Primary>, expected: usize) {
    for _ in 0..250 {
        if primary.replica_count().await == expected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} registered replica(s)", expected);
}

#[tokio::test]
async fn test_replication_end_to_end() {
    let (_, primary) = start_primary(17010).await;
    let replica_store = start_replica(17011, 17010).await;

    // Make sure the replica's own listener is serving before writing.
    let (mut replica_reader, mut replica_writer) = connect(17011).await;

    // Writes only fan out to replicas that completed PSYNC.
    wait_for_replica_count(&primary, 1).await;

    let (mut reader, mut writer) = connect(17010).await;
    send(&mut writer, &["SET", "x", "42"]).await;
    assert_eq!(read_reply_line(&mut reader).await, "+OK");

    // The write fans out asynchronously; poll until it lands.
    let mut arrived = false;
    for _ in 0..100 {
        if replica_store.get("x").await.as_deref() == Some("42") {
            arrived = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(arrived, "write never reached the replica");

    // The replica serves the key over its own listener too.
    send(&mut replica_writer, &["GET", "x"]).await;
    assert_eq!(read_bulk(&mut replica_reader).await, Some("42".to_string()));

    // And the barrier sees the replica caught up.
    send(&mut writer, &["WAIT", "1", "2000"]).await;
    assert_eq!(read_reply_line(&mut reader).await, ":1");
}

#[tokio::test]
async fn test_wait_counts_two_replicas() {
    let (_, primary) = start_primary(17030).await;
    let store_a = start_replica(17031, 17030).await;
    let store_b = start_replica(17032, 17030).await;

    wait_for_replica_count(&primary, 2).await;

    let (mut reader, mut writer) = connect(17030).await;
    send(&mut writer, &["SET", "x", "1"]).await;
    assert_eq!(read_reply_line(&mut reader).await, "+OK");

    for store in [&store_a, &store_b] {
        let mut arrived = false;
        for _ in 0..100 {
            if store.get("x").await.is_some() {
                arrived = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(arrived, "write never reached a replica");
    }

    let started = Instant::now();
    send(&mut writer, &["WAIT", "2", "1000"]).await;
    assert_eq!(read_reply_line(&mut reader).await, ":2");
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// A replica that completes the handshake but never answers GETACK.
async fn silent_replica(port: u16) {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    for argv in [
        vec!["PING"],
        vec!["REPLCONF", "listening-port", "0"],
        vec!["REPLCONF", "capa", "psync2"],
    ] {
        writer
            .write_all(protocol::encode_array(&argv).as_bytes())
            .await
            .unwrap();
        protocol::read_line(&mut reader).await.unwrap();
    }
    writer
        .write_all(protocol::encode_array(&["PSYNC", "?", "-1"]).as_bytes())
        .await
        .unwrap();
    let fullresync = protocol::read_line(&mut reader).await.unwrap();
    assert!(fullresync.starts_with("+FULLRESYNC "));
    protocol::read_bulk_bytes(&mut reader).await.unwrap();

    // Hold the connection open without ever acking.
    let mut sink = vec![0u8; 1024];
    loop {
        if reader.read(&mut sink).await.unwrap_or(0) == 0 {
            return;
        }
    }
}

#[tokio::test]
async fn test_wait_times_out_on_silent_replica() {
    let (_, primary) = start_primary(17020).await;
    connect(17020).await; // make sure the listener is up
    tokio::spawn(silent_replica(17020));

    // Wait for the handshake to register the replica.
    for _ in 0..100 {
        if primary.replica_count().await == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(primary.replica_count().await, 1);

    let (mut reader, mut writer) = connect(17020).await;
    send(&mut writer, &["SET", "x", "1"]).await;
    assert_eq!(read_reply_line(&mut reader).await, "+OK");

    let started = Instant::now();
    send(&mut writer, &["WAIT", "2", "200"]).await;
    assert_eq!(read_reply_line(&mut reader).await, ":0");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(180), "returned too early: {:?}", elapsed);
}

/// Accept one replica connection and walk it through the handshake.
async fn accept_and_sync(listener: &TcpListener) -> (Reader, OwnedWriteHalf) {
    let (stream, _) = listener.accept().await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    for _ in 0..3 {
        protocol::parse(&mut reader).await.unwrap();
        writer
            .write_all(protocol::encode_simple("OK").as_bytes())
            .await
            .unwrap();
    }
    let psync = protocol::parse(&mut reader).await.unwrap();
    assert_eq!(psync[0], "PSYNC");
    writer
        .write_all(
            protocol::encode_simple(&format!("FULLRESYNC {} 0", "f".repeat(40))).as_bytes(),
        )
        .await
        .unwrap();
    writer
        .write_all(format!("${}\r\n", storage::EMPTY_SNAPSHOT.len()).as_bytes())
        .await
        .unwrap();
    writer.write_all(storage::EMPTY_SNAPSHOT).await.unwrap();

    (reader, writer)
}

#[tokio::test]
async fn test_replica_reconnects_after_primary_drop() {
    let listener = TcpListener::bind("127.0.0.1:17040").await.unwrap();

    let store = Store::new();
    let replica = Replica::new(store.clone(), 17041, "127.0.0.1".to_string(), 17040);
    tokio::spawn(async move { replica.run().await });

    // First session: sync, then drop the connection.
    let first = timeout(Duration::from_secs(5), accept_and_sync(&listener))
        .await
        .expect("replica never connected");
    drop(first);

    // The replica retries on a fixed backoff and replays the handshake.
    let (_reader, mut writer) = timeout(Duration::from_secs(15), accept_and_sync(&listener))
        .await
        .expect("replica never reconnected");

    writer
        .write_all(protocol::encode_array(&["SET", "k", "after"]).as_bytes())
        .await
        .unwrap();

    let mut arrived = false;
    for _ in 0..100 {
        if store.get("k").await.as_deref() == Some("after") {
            arrived = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(arrived, "stream did not resume after reconnect");
}
