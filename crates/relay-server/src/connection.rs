use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

use librelay::{EntryStream, RelayError};
use relay_protocol::{
    Channel, ErrorCode, LifecycleEvent, ParticipantId, Request, Response, SessionId,
};

use crate::server::SharedRegistry;

const OUTGOING_QUEUE: usize = 256;

/// Frames queued for this connection's single writer task. The writer
/// emits one whole frame at a time, so aborting a producer mid-send can
/// never tear a frame on the wire.
enum Outgoing {
    Frame(Response),
    /// Close the write half so the client's read fails and its reconnect
    /// logic takes over.
    Shutdown,
}

/// Per-client state: which participants this connection joined and which
/// forwarding tasks it owns. Both are torn down when the socket drops.
struct ClientState {
    joins: Vec<(SessionId, ParticipantId)>,
    subscriptions: HashMap<SessionId, JoinHandle<()>>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            joins: Vec::new(),
            subscriptions: HashMap::new(),
        }
    }
}

/// Handle a single client connection.
pub async fn handle_client(stream: UnixStream, registry: SharedRegistry) {
    let (reader, writer) = stream.into_split();
    let reader = BufReader::new(reader);
    let (out_tx, out_rx) = mpsc::channel::<Outgoing>(OUTGOING_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, out_rx));
    let mut client_state = ClientState::new();

    let mut lines = reader.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("client disconnected");
                break;
            }
            Err(e) => {
                error!("read error: {e}");
                break;
            }
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("invalid request: {e}"),
                    code: ErrorCode::InvalidRequest,
                };
                if out_tx.send(Outgoing::Frame(resp)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let response = handle_request(request, &registry, &out_tx, &mut client_state).await;

        if let Some(response) = response {
            if out_tx.send(Outgoing::Frame(response)).await.is_err() {
                error!("write side closed");
                break;
            }
        }
    }

    // Cleanup: stop forwarding tasks, then leave on behalf of every
    // participant this connection joined.
    for (_, handle) in client_state.subscriptions.drain() {
        handle.abort();
    }
    for (session_id, participant) in client_state.joins.drain(..) {
        let _ = registry
            .send(&session_id, &LifecycleEvent::Leave { participant })
            .await;
    }
    drop(out_tx);
    let _ = writer_task.await;
}

async fn handle_request(
    request: Request,
    registry: &SharedRegistry,
    out_tx: &mpsc::Sender<Outgoing>,
    client_state: &mut ClientState,
) -> Option<Response> {
    match request {
        Request::SessionCreate {
            session_id,
            max_participants,
        } => {
            let id = registry.create_session(session_id, Some(max_participants));
            Some(Response::Ok {
                data: Some(serde_json::json!({ "session_id": id })),
            })
        }

        Request::SessionSend { session_id, event } => {
            match registry.send(&session_id, &event).await {
                Ok(info) => {
                    match &event {
                        LifecycleEvent::Join { participant } => {
                            client_state
                                .joins
                                .push((session_id.clone(), participant.clone()));
                        }
                        LifecycleEvent::Leave { participant } => {
                            if let Some(pos) = client_state
                                .joins
                                .iter()
                                .position(|(sid, p)| sid == &session_id && p == participant)
                            {
                                client_state.joins.remove(pos);
                            }
                        }
                        _ => {}
                    }
                    Some(Response::Ok {
                        data: serde_json::to_value(&info).ok(),
                    })
                }
                Err(e) => Some(error_response(e)),
            }
        }

        Request::SessionInfo { session_id } => match registry.session_info(&session_id).await {
            Ok(info) => Some(Response::Ok {
                data: serde_json::to_value(&info).ok(),
            }),
            Err(e) => Some(error_response(e)),
        },

        Request::SessionList => {
            let sessions = registry.list_sessions().await;
            Some(Response::Ok {
                data: Some(serde_json::to_value(&sessions).unwrap_or_default()),
            })
        }

        Request::Publish {
            session_id,
            channel,
            data,
        } => match registry.publish(&session_id, channel, data).await {
            Ok(offset) => Some(Response::Ok {
                data: Some(serde_json::json!({ "offset": offset })),
            }),
            Err(e) => Some(error_response(e)),
        },

        Request::Subscribe {
            session_id,
            from_offset,
        } => {
            let stream = match registry.subscribe(&session_id, from_offset).await {
                Ok(stream) => stream,
                Err(e) => return Some(error_response(e)),
            };

            // Ack before any entry so the subscriber knows the replay
            // boundary was accepted; the writer task preserves queue order.
            let ack = Response::Ok {
                data: Some(serde_json::json!({ "subscribed": session_id })),
            };
            if out_tx.send(Outgoing::Frame(ack)).await.is_err() {
                return None;
            }

            // One forwarding task per session per client; a re-subscribe
            // replaces the previous cursor.
            let tx = out_tx.clone();
            let sid = session_id.clone();
            let handle = tokio::spawn(async move {
                forward_entries(stream, tx, sid).await;
            });
            if let Some(previous) = client_state.subscriptions.insert(session_id, handle) {
                previous.abort();
            }
            None
        }

        Request::Unsubscribe { session_id } => {
            if let Some(handle) = client_state.subscriptions.remove(&session_id) {
                handle.abort();
            }
            Some(Response::Ok { data: None })
        }
    }
}

fn error_response(err: RelayError) -> Response {
    let (code, message) = err.to_error_code();
    Response::Error { message, code }
}

/// Forward a replay/live stream to the writer task.
///
/// A stream that ends without the session's terminal close event means
/// this subscriber fell behind the broadcast window and has a hole we
/// cannot repair here. Closing the socket makes the client reconnect and
/// resume from its own cursor, replaying the gap from the retained log.
async fn forward_entries(
    mut stream: EntryStream,
    tx: mpsc::Sender<Outgoing>,
    session_id: SessionId,
) {
    let mut closed = false;
    while let Some(entry) = stream.next().await {
        closed = entry.channel == Channel::Connected
            && entry
                .data
                .get("closed")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
        if tx.send(Outgoing::Frame(Response::Event(entry))).await.is_err() {
            return;
        }
    }
    if closed {
        debug!(session_id = %session_id, "subscription stream ended");
    } else {
        warn!(session_id = %session_id, "subscriber fell behind, disconnecting for resume");
        let _ = tx.send(Outgoing::Shutdown).await;
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Outgoing>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outgoing::Frame(response) => {
                if let Err(e) = write_response(&mut writer, &response).await {
                    debug!("write error: {e}");
                    break;
                }
            }
            Outgoing::Shutdown => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &Response,
) -> Result<(), std::io::Error> {
    let json = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
