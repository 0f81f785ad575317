use std::time::Duration;

use shardline_stream::{
    ChannelDecoder, ConnectionEvent, ConnectionId, ConnectionOptions, ConnectionState, Directive,
    ErrorKind, Frame, StreamConnection,
};
use shardline_subjects::{Group, SubjectId};
use shardline_transport::TransportError;
use shardline_transport_memory::MemoryTransport;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct Harness {
    transport: MemoryTransport,
    frames: mpsc::Receiver<(ConnectionId, Frame)>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
    connection: StreamConnection,
}

fn group(raw: &[u64]) -> Group {
    Group::new(raw.iter().copied().map(SubjectId::new)).unwrap()
}

fn spawn_with(transport: MemoryTransport, options: ConnectionOptions, directive: Directive) -> Harness {
    let (decoder, frames) = ChannelDecoder::new(64);
    let (events_tx, events) = mpsc::unbounded_channel();
    let shutdown_token = CancellationToken::new();
    let task_tracker = TaskTracker::new();

    let connection = StreamConnection::spawn(
        ConnectionId::new(1, 0),
        group(&[1, 2, 3]),
        transport.clone(),
        decoder,
        options.into(),
        directive,
        events_tx,
        &shutdown_token,
        &task_tracker,
    );

    Harness {
        transport,
        frames,
        events,
        shutdown_token,
        task_tracker,
        connection,
    }
}

fn spawn(directive: Directive) -> Harness {
    spawn_with(MemoryTransport::default(), ConnectionOptions::default(), directive)
}

async fn wait_for_state(connection: &StreamConnection, state: ConnectionState) {
    connection
        .watch_status()
        .wait_for(|status| status.state == state)
        .await
        .unwrap();
}

async fn next_payload(frames: &mut mpsc::Receiver<(ConnectionId, Frame)>) -> String {
    let (_, frame) = frames.recv().await.unwrap();
    String::from_utf8(frame.payload.to_vec()).unwrap()
}

#[tokio::test]
async fn test_forwards_frames_split_into_single_bytes() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut harness = spawn(Directive::Forward);
    let stream = harness.transport.accept().await.unwrap();
    assert_eq!(stream.group(), &group(&[1, 2, 3]));

    stream
        .send_chunked(b"{\"id\":1}\r\n\r\n   \r\n{\"id\":2}\r\n{\"id\"", 1)
        .unwrap();

    let (id, frame) = harness.frames.recv().await.unwrap();
    assert_eq!(id, ConnectionId::new(1, 0));
    assert_eq!(frame, Frame::data("{\"id\":1}"));
    assert_eq!(next_payload(&mut harness.frames).await, "{\"id\":2}");

    stream.send(":3}\r\n").unwrap();
    assert_eq!(next_payload(&mut harness.frames).await, "{\"id\":3}");
    assert_eq!(harness.connection.state(), ConnectionState::Active);
}

#[tokio::test]
async fn test_control_frames_are_tagged() {
    let mut harness = spawn(Directive::Forward);
    let stream = harness.transport.accept().await.unwrap();

    stream.send_line("{\"control\":{\"control_uri\":\"/1.1/site/c/1\"}}").unwrap();
    stream.send_line("{\"for_user\":1}").unwrap();

    let (_, control) = harness.frames.recv().await.unwrap();
    assert_eq!(control, Frame::control("{\"control\":{\"control_uri\":\"/1.1/site/c/1\"}}"));
    let (_, data) = harness.frames.recv().await.unwrap();
    assert_eq!(data, Frame::data("{\"for_user\":1}"));
}

#[tokio::test(start_paused = true)]
async fn test_held_frames_flush_in_order() {
    let mut harness = spawn(Directive::Hold);
    let stream = harness.transport.accept().await.unwrap();

    stream.send_line("first").unwrap();
    stream.send_line("second").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(harness.frames.try_recv().is_err());

    harness.connection.forward();
    stream.send_line("third").unwrap();

    assert_eq!(next_payload(&mut harness.frames).await, "first");
    assert_eq!(next_payload(&mut harness.frames).await, "second");
    assert_eq!(next_payload(&mut harness.frames).await, "third");
}

#[tokio::test(start_paused = true)]
async fn test_hold_buffer_drops_oldest() {
    let _ = tracing_subscriber::fmt::try_init();

    let options = ConnectionOptions {
        max_pending_frames: 2,
        ..ConnectionOptions::default()
    };
    let mut harness = spawn_with(MemoryTransport::default(), options, Directive::Hold);
    let stream = harness.transport.accept().await.unwrap();

    for n in 1..=3 {
        stream.send_line(&n.to_string()).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    harness.connection.forward();

    assert_eq!(next_payload(&mut harness.frames).await, "2");
    assert_eq!(next_payload(&mut harness.frames).await, "3");
    assert!(harness.frames.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_fails_connection() {
    let options = ConnectionOptions {
        idle_timeout: Duration::from_secs(5),
        ..ConnectionOptions::default()
    };
    let harness = spawn_with(MemoryTransport::default(), options, Directive::Forward);
    let _stream = harness.transport.accept().await.unwrap();

    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.last_error, Some(ErrorKind::TransportFailure));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_connection_alive() {
    let options = ConnectionOptions {
        idle_timeout: Duration::from_secs(5),
        ..ConnectionOptions::default()
    };
    let harness = spawn_with(MemoryTransport::default(), options, Directive::Forward);
    let stream = harness.transport.accept().await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(3)).await;
        stream.send("\r\n").unwrap();
    }

    assert_eq!(harness.connection.state(), ConnectionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_directive_change_keeps_idle_deadline() {
    let options = ConnectionOptions {
        idle_timeout: Duration::from_secs(5),
        ..ConnectionOptions::default()
    };
    let harness = spawn_with(MemoryTransport::default(), options, Directive::Hold);
    let _stream = harness.transport.accept().await.unwrap();
    wait_for_state(&harness.connection, ConnectionState::Active).await;
    let started = tokio::time::Instant::now();

    tokio::time::sleep(Duration::from_secs(3)).await;
    harness.connection.forward();

    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.last_error, Some(ErrorKind::TransportFailure));
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_with_stalled_decoder() {
    let (decoder, _frames) = ChannelDecoder::new(1);
    let (events_tx, _events) = mpsc::unbounded_channel();
    let transport = MemoryTransport::default();
    let shutdown_token = CancellationToken::new();
    let task_tracker = TaskTracker::new();

    let connection = StreamConnection::spawn(
        ConnectionId::new(1, 0),
        group(&[1]),
        transport.clone(),
        decoder,
        ConnectionOptions::default().into(),
        Directive::Forward,
        events_tx,
        &shutdown_token,
        &task_tracker,
    );
    let mut stream = transport.accept().await.unwrap();
    for n in 0..3 {
        stream.send_line(&n.to_string()).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    shutdown_token.cancel();
    let status = tokio::time::timeout(Duration::from_secs(60), connection.terminated())
        .await
        .unwrap();
    assert_eq!(status.state, ConnectionState::Closed);
    stream.closed().await;
}

#[tokio::test(start_paused = true)]
async fn test_setup_timeout_fails_connection() {
    let transport = MemoryTransport::default();
    transport.set_open_delay(Some(Duration::from_secs(60)));
    let options = ConnectionOptions {
        setup_timeout: Duration::from_secs(5),
        ..ConnectionOptions::default()
    };
    let harness = spawn_with(transport, options, Directive::Forward);

    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.last_error, Some(ErrorKind::TransportFailure));
    assert_eq!(harness.transport.open_count(), 0);
}

#[tokio::test]
async fn test_auth_failure_is_reported() {
    let transport = MemoryTransport::default();
    transport.fail_next_open(TransportError::Auth("invalid token".to_string()));
    let mut harness = spawn_with(transport, ConnectionOptions::default(), Directive::Forward);

    let event = harness.events.recv().await.unwrap();
    assert_eq!(event.id, ConnectionId::new(1, 0));
    assert_eq!(event.state, ConnectionState::Failed);
    assert_eq!(event.error, Some(ErrorKind::AuthFailure));
    assert_eq!(harness.connection.status().last_error, Some(ErrorKind::AuthFailure));
}

#[tokio::test]
async fn test_oversized_frame_fails_connection() {
    let options = ConnectionOptions {
        max_frame_len: 8,
        ..ConnectionOptions::default()
    };
    let harness = spawn_with(MemoryTransport::default(), options, Directive::Forward);
    let stream = harness.transport.accept().await.unwrap();

    stream.send("0123456789abcdef").unwrap();

    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.last_error, Some(ErrorKind::FramingError));
}

#[tokio::test]
async fn test_end_of_stream_fails_active_connection() {
    let mut harness = spawn(Directive::Forward);
    let stream = harness.transport.accept().await.unwrap();

    stream.send_line("last").unwrap();
    stream.disconnect();

    assert_eq!(next_payload(&mut harness.frames).await, "last");
    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.last_error, Some(ErrorKind::TransportFailure));
}

#[tokio::test]
async fn test_drain_keeps_dispatching_until_closed() {
    let mut harness = spawn(Directive::Forward);
    let mut stream = harness.transport.accept().await.unwrap();
    wait_for_state(&harness.connection, ConnectionState::Active).await;

    harness.connection.drain();
    wait_for_state(&harness.connection, ConnectionState::Draining).await;

    stream.send_line("while draining").unwrap();
    assert_eq!(next_payload(&mut harness.frames).await, "while draining");

    harness.connection.close();
    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert_eq!(status.last_error, None);

    stream.closed().await;
    assert!(stream.is_closed());
}

#[tokio::test]
async fn test_end_of_stream_while_draining_closes() {
    let harness = spawn(Directive::Forward);
    let stream = harness.transport.accept().await.unwrap();
    wait_for_state(&harness.connection, ConnectionState::Active).await;

    harness.connection.drain();
    wait_for_state(&harness.connection, ConnectionState::Draining).await;
    stream.disconnect();

    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Closed);
}

#[tokio::test]
async fn test_shutdown_closes_transport() {
    let mut harness = spawn(Directive::Forward);
    let mut stream = harness.transport.accept().await.unwrap();
    wait_for_state(&harness.connection, ConnectionState::Active).await;

    harness.shutdown_token.cancel();
    harness.task_tracker.close();
    harness.task_tracker.wait().await;

    assert_eq!(harness.connection.state(), ConnectionState::Closed);
    stream.closed().await;

    let states: Vec<_> = std::iter::from_fn(|| harness.events.try_recv().ok())
        .map(|event| event.state)
        .collect();
    assert_eq!(states, vec![ConnectionState::Active, ConnectionState::Closed]);
}

#[tokio::test]
async fn test_close_before_connected() {
    let transport = MemoryTransport::default();
    transport.set_open_delay(Some(Duration::from_secs(3600)));
    let harness = spawn_with(transport, ConnectionOptions::default(), Directive::Hold);

    harness.connection.close();
    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert_eq!(harness.transport.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_while_held_discards_frames() {
    let mut harness = spawn(Directive::Hold);
    let stream = harness.transport.accept().await.unwrap();

    stream.send_line("never delivered").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    harness.connection.close();
    let status = harness.connection.terminated().await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(harness.frames.try_recv().is_err());
}
