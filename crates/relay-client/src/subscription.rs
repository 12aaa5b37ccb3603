use std::path::PathBuf;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use librelay::EventRouter;
use relay_protocol::{Channel, LogEntry, Request, Response, SessionId};

use crate::{BackoffPolicy, ClientError, ClientResult, RelayClient};

/// Client-side view of the transport, surfaced so a consumer can show a
/// "reconnecting" indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Starting offset for the initial replay; `None` tails live only.
    pub from_offset: Option<u64>,
    pub backoff: BackoffPolicy,
}

/// A logically continuous subscription to one session.
///
/// Runs as its own task: deduplicates by offset, routes every applied
/// entry through its `EventRouter`, and survives transport drops by
/// resuming from `last_applied + 1` under a bounded exponential backoff.
/// Delivery is exactly-once from the consumer's point of view even though
/// the transport is only at-least-once across reconnects.
pub struct Subscription {
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    applied_rx: watch::Receiver<Option<u64>>,
    handle: JoinHandle<ClientResult<()>>,
}

impl Subscription {
    pub fn spawn(
        socket_path: PathBuf,
        session_id: SessionId,
        options: SubscribeOptions,
        router: EventRouter,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (applied_tx, applied_rx) = watch::channel(options.from_offset.and_then(|f| f.checked_sub(1)));

        let handle = tokio::spawn(run(
            socket_path,
            session_id,
            options,
            router,
            state_tx,
            applied_tx,
            cancel_rx,
        ));

        Self {
            cancel_tx,
            state_rx,
            applied_rx,
            handle,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch for connection-state changes (e.g. to render an indicator).
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Highest offset the consumer has applied.
    pub fn last_applied_offset(&self) -> Option<u64> {
        *self.applied_rx.borrow()
    }

    /// Cancel the subscription, including any in-flight backoff wait.
    /// Idempotent; the task transitions to disconnected and exits.
    pub fn unsubscribe(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Wait for the task to finish. `Ok(())` means the session closed or
    /// the consumer unsubscribed; errors are terminal (retry budget
    /// exhausted or a hard server rejection).
    pub async fn join(self) -> ClientResult<()> {
        self.handle.await.map_err(|err| ClientError::Connection {
            message: format!("subscription task failed: {err}"),
        })?
    }
}

enum Opened {
    Ready(RelayClient, Vec<LogEntry>),
    Cancelled,
    Failed(ClientError),
}

#[allow(clippy::too_many_arguments)]
async fn run(
    socket_path: PathBuf,
    session_id: SessionId,
    options: SubscribeOptions,
    mut router: EventRouter,
    state_tx: watch::Sender<ConnectionState>,
    applied_tx: watch::Sender<Option<u64>>,
    mut cancel_rx: watch::Receiver<bool>,
) -> ClientResult<()> {
    let max_attempts = options.backoff.max_attempts.max(1);
    let mut last_applied: Option<u64> = options.from_offset.and_then(|f| f.checked_sub(1));
    let mut attempt: u32 = 0;
    let mut connected_once = false;

    loop {
        let _ = state_tx.send(if connected_once || attempt > 0 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        // Resume exactly after the last applied entry; before anything is
        // applied, honor the caller's starting offset.
        let from_offset = match last_applied {
            Some(offset) => Some(offset + 1),
            None => options.from_offset,
        };

        let opened = open(&socket_path, &session_id, from_offset, &mut cancel_rx).await;
        let (mut client, pending) = match opened {
            Opened::Ready(client, pending) => (client, pending),
            Opened::Cancelled => {
                let _ = state_tx.send(ConnectionState::Disconnected);
                return Ok(());
            }
            Opened::Failed(err) if err.is_transient() => {
                attempt += 1;
                if attempt > max_attempts {
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return Err(ClientError::RetryExhausted {
                        operation: format!("subscribe({session_id})"),
                        attempts: max_attempts,
                        last_error: err.to_string(),
                    });
                }
                let delay = options.backoff.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        return Ok(());
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            Opened::Failed(err) => {
                let _ = state_tx.send(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let _ = state_tx.send(ConnectionState::Connected);
        connected_once = true;
        attempt = 0;

        // Entries the server interleaved before the subscribe ack.
        let mut closed = false;
        for entry in pending {
            if apply(&entry, &mut last_applied, &mut router, &applied_tx) {
                closed = true;
                break;
            }
        }
        if closed {
            let _ = state_tx.send(ConnectionState::Disconnected);
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return Ok(());
                }
                response = client.recv() => match response {
                    Ok(Response::Event(entry)) => {
                        if apply(&entry, &mut last_applied, &mut router, &applied_tx) {
                            let _ = state_tx.send(ConnectionState::Disconnected);
                            return Ok(());
                        }
                    }
                    Ok(Response::Ok { .. }) => continue,
                    Ok(Response::Error { code, message }) => {
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        return Err(ClientError::Server { code, message });
                    }
                    Err(err) if err.is_transient() => {
                        warn!(session_id = %session_id, error = %err, "transport dropped");
                        break;
                    }
                    Err(err) => {
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        return Err(err);
                    }
                }
            }
        }
    }
}

/// Apply one delivered entry: discard duplicates from reconnect replay
/// overlap, advance the cursor, route, and report whether this was the
/// session's terminal control event.
fn apply(
    entry: &LogEntry,
    last_applied: &mut Option<u64>,
    router: &mut EventRouter,
    applied_tx: &watch::Sender<Option<u64>>,
) -> bool {
    if let Some(last) = *last_applied {
        if entry.offset <= last {
            return false;
        }
    }
    *last_applied = Some(entry.offset);
    let _ = applied_tx.send(*last_applied);

    let terminal = entry.channel == Channel::Connected
        && entry
            .data
            .get("closed")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

    router.route(entry);
    terminal
}

async fn open(
    socket_path: &std::path::Path,
    session_id: &str,
    from_offset: Option<u64>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Opened {
    let attempt = async {
        let mut client = RelayClient::connect(socket_path).await?;
        client
            .send(&Request::Subscribe {
                session_id: session_id.to_string(),
                from_offset,
            })
            .await?;

        // Wait for the subscribe ack; buffer any entries the server sends
        // ahead of it so nothing is lost.
        let mut pending = Vec::new();
        loop {
            match client.recv().await? {
                Response::Ok { .. } => return Ok((client, pending)),
                Response::Event(entry) => pending.push(entry),
                Response::Error { code, message } => {
                    return Err(ClientError::Server { code, message });
                }
            }
        }
    };

    tokio::select! {
        _ = cancel_rx.changed() => Opened::Cancelled,
        result = attempt => match result {
            Ok((client, pending)) => Opened::Ready(client, pending),
            Err(err) => Opened::Failed(err),
        },
    }
}
