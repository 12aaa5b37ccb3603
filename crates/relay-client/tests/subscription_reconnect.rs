use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use librelay::EventRouter;
use relay_client::{BackoffPolicy, ClientError, ConnectionState, SubscribeOptions, Subscription};
use relay_protocol::{Channel, LogEntry, Request, Response, now_epoch_ms};

fn entry_line(offset: u64, channel: Channel, data: serde_json::Value) -> String {
    serde_json::to_string(&Response::Event(LogEntry {
        offset,
        channel,
        timestamp_epoch_ms: now_epoch_ms(),
        data,
    }))
    .unwrap()
}

async fn write_line(stream: &mut UnixStream, line: &str) {
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    stream.flush().await.unwrap();
}

async fn read_subscribe(stream: &mut UnixStream) -> Option<u64> {
    let (read_half, _) = stream.split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    match serde_json::from_str::<Request>(&line).unwrap() {
        Request::Subscribe { from_offset, .. } => from_offset,
        other => panic!("expected subscribe, got {other:?}"),
    }
}

fn collecting_router(seen: Arc<Mutex<Vec<u64>>>) -> EventRouter {
    let mut router = EventRouter::new();
    for channel in Channel::ALL {
        let seen = Arc::clone(&seen);
        router.on(channel, move |entry| {
            seen.lock().unwrap().push(entry.offset);
            Ok(())
        });
    }
    router
}

#[tokio::test]
async fn reconnect_resumes_after_last_applied_with_no_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("relay.sock");
    let listener = UnixListener::bind(&sock).unwrap();

    let server = tokio::spawn(async move {
        // First connection: replay 0 and 1, then drop mid-stream.
        let (mut stream, _) = listener.accept().await.unwrap();
        let from = read_subscribe(&mut stream).await;
        assert_eq!(from, Some(0));
        write_line(&mut stream, r#"{"type":"ok"}"#).await;
        write_line(
            &mut stream,
            &entry_line(0, Channel::Chunk, serde_json::json!({"text":"a"})),
        )
        .await;
        write_line(
            &mut stream,
            &entry_line(1, Channel::Chunk, serde_json::json!({"text":"b"})),
        )
        .await;
        drop(stream);

        // Second connection: the client must resume at 2. Replay overlap
        // re-sends 1, which the client has to discard as a duplicate.
        let (mut stream, _) = listener.accept().await.unwrap();
        let from = read_subscribe(&mut stream).await;
        assert_eq!(from, Some(2));
        write_line(&mut stream, r#"{"type":"ok"}"#).await;
        write_line(
            &mut stream,
            &entry_line(1, Channel::Chunk, serde_json::json!({"text":"b"})),
        )
        .await;
        write_line(
            &mut stream,
            &entry_line(2, Channel::Chunk, serde_json::json!({"text":"c"})),
        )
        .await;
        write_line(
            &mut stream,
            &entry_line(3, Channel::Connected, serde_json::json!({"closed": true})),
        )
        .await;
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = Subscription::spawn(
        sock,
        "s-1".to_string(),
        SubscribeOptions {
            from_offset: Some(0),
            backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(10),
                multiplier: 2.0,
                max_delay: Duration::from_millis(100),
                max_attempts: 5,
            },
        },
        collecting_router(Arc::clone(&seen)),
    );

    subscription.join().await.unwrap();
    server.await.unwrap();

    // Every offset applied exactly once, in order, ending with the
    // terminal control event.
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_follows_the_backoff_curve() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("absent.sock");

    let started = tokio::time::Instant::now();
    let subscription = Subscription::spawn(
        sock,
        "s-1".to_string(),
        SubscribeOptions {
            from_offset: Some(0),
            backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(100),
                multiplier: 2.0,
                max_delay: Duration::from_millis(1000),
                max_attempts: 4,
            },
        },
        EventRouter::new(),
    );

    let err = subscription.join().await.unwrap_err();
    match err {
        ClientError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("expected retry exhaustion, got {other:?}"),
    }

    // Four failed retries waited 100 + 200 + 400 + 800 ms.
    assert_eq!(
        started.elapsed(),
        Duration::from_millis(100 + 200 + 400 + 800)
    );
}

#[tokio::test]
async fn unsubscribe_cancels_an_in_flight_backoff_wait() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("absent.sock");

    let subscription = Subscription::spawn(
        sock,
        "s-1".to_string(),
        SubscribeOptions {
            from_offset: None,
            backoff: BackoffPolicy {
                initial_delay: Duration::from_secs(60),
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
                max_attempts: 10,
            },
        },
        EventRouter::new(),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    subscription.unsubscribe();
    // Idempotent.
    subscription.unsubscribe();

    let result = tokio::time::timeout(Duration::from_secs(2), subscription.join())
        .await
        .expect("unsubscribe must not block on the backoff wait");
    assert!(result.is_ok());
}

#[tokio::test]
async fn connection_state_is_observable() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("relay.sock");
    let listener = UnixListener::bind(&sock).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_subscribe(&mut stream).await;
        write_line(&mut stream, r#"{"type":"ok"}"#).await;
        // Hold the connection open until the client goes away.
        let mut buf = vec![0u8; 64];
        use tokio::io::AsyncReadExt;
        let _ = stream.read(&mut buf).await;
    });

    let subscription = Subscription::spawn(
        sock,
        "s-1".to_string(),
        SubscribeOptions::default(),
        EventRouter::new(),
    );

    let mut states = subscription.state_watch();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *states.borrow() == ConnectionState::Connected {
                break;
            }
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("subscription should reach connected");

    subscription.unsubscribe();
    subscription.join().await.unwrap();
    server.await.unwrap();
}
