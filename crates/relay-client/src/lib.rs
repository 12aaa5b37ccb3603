pub mod subscription;

use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use relay_protocol::{
    Channel, ErrorCode, LifecycleEvent, MAX_JSON_LINE_BYTES, Request, Response, SessionId,
    SessionInfo,
};

pub use subscription::{ConnectionState, SubscribeOptions, Subscription};

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {message}")]
    Connection { message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("server error ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },
    #[error("retry exhausted for {operation} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
}

impl ClientError {
    /// Transport-level failures are retried by the subscription's backoff
    /// loop; everything else reflects a real rejection and is surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Reconnect schedule: delay = min(max_delay, initial × multiplier^attempt),
/// bounded by `max_attempts`. All of it is configuration, not policy.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = self.multiplier.max(1.0).powi(exponent as i32);
        let raw = (self.initial_delay.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(raw.min(self.max_delay.as_millis() as u64))
    }
}

/// Framed JSON-lines connection to the relay server.
pub struct RelayClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
}

impl RelayClient {
    pub async fn connect(socket_path: &Path) -> ClientResult<Self> {
        let stream =
            UnixStream::connect(socket_path)
                .await
                .map_err(|err| ClientError::Connection {
                    message: format!("failed to connect {}: {err}", socket_path.display()),
                })?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: FramedRead::new(
                read_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
            writer: FramedWrite::new(
                write_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
        })
    }

    pub async fn send(&mut self, req: &Request) -> ClientResult<()> {
        let line = serde_json::to_string(req).map_err(|err| ClientError::Protocol {
            message: format!("failed to encode request: {err}"),
        })?;
        self.writer
            .send(line)
            .await
            .map_err(|err| ClientError::Connection {
                message: format!("socket write failed: {err}"),
            })
    }

    pub async fn recv(&mut self) -> ClientResult<Response> {
        let Some(line) = self.reader.next().await else {
            return Err(ClientError::Connection {
                message: "server disconnected".to_string(),
            });
        };
        let line = line.map_err(|err| ClientError::Connection {
            message: format!("socket read failed: {err}"),
        })?;
        serde_json::from_str(&line).map_err(|err| ClientError::Protocol {
            message: format!("invalid json response: {err}"),
        })
    }

    /// Send one request and wait for its Ok/Error, skipping any event
    /// frames interleaved by an active subscription.
    pub async fn request(&mut self, req: &Request) -> ClientResult<Option<serde_json::Value>> {
        self.send(req).await?;
        loop {
            match self.recv().await? {
                Response::Event(_) => continue,
                Response::Ok { data } => return Ok(data),
                Response::Error { message, code } => {
                    return Err(ClientError::Server { code, message });
                }
            }
        }
    }

    pub async fn create_session(
        &mut self,
        session_id: Option<SessionId>,
        max_participants: usize,
    ) -> ClientResult<SessionId> {
        let data = self
            .request(&Request::SessionCreate {
                session_id,
                max_participants,
            })
            .await?
            .ok_or_else(|| ClientError::Protocol {
                message: "missing session create payload".to_string(),
            })?;
        data.get("session_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol {
                message: "session create payload missing 'session_id'".to_string(),
            })
    }

    pub async fn session_send(
        &mut self,
        session_id: &str,
        event: LifecycleEvent,
    ) -> ClientResult<SessionInfo> {
        let data = self
            .request(&Request::SessionSend {
                session_id: session_id.to_string(),
                event,
            })
            .await?
            .ok_or_else(|| ClientError::Protocol {
                message: "missing session send payload".to_string(),
            })?;
        serde_json::from_value(data).map_err(|err| ClientError::Protocol {
            message: format!("failed to parse session info: {err}"),
        })
    }

    pub async fn publish(
        &mut self,
        session_id: &str,
        channel: Channel,
        data: serde_json::Value,
    ) -> ClientResult<u64> {
        let payload = self
            .request(&Request::Publish {
                session_id: session_id.to_string(),
                channel,
                data,
            })
            .await?
            .ok_or_else(|| ClientError::Protocol {
                message: "missing publish payload".to_string(),
            })?;
        payload
            .get("offset")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ClientError::Protocol {
                message: "publish payload missing 'offset'".to_string(),
            })
    }

    pub async fn session_info(&mut self, session_id: &str) -> ClientResult<SessionInfo> {
        let data = self
            .request(&Request::SessionInfo {
                session_id: session_id.to_string(),
            })
            .await?
            .ok_or_else(|| ClientError::Protocol {
                message: "missing session info payload".to_string(),
            })?;
        serde_json::from_value(data).map_err(|err| ClientError::Protocol {
            message: format!("failed to parse session info: {err}"),
        })
    }

    pub async fn session_list(&mut self) -> ClientResult<Vec<SessionInfo>> {
        let data = self
            .request(&Request::SessionList)
            .await?
            .unwrap_or_else(|| serde_json::json!([]));
        serde_json::from_value(data).map_err(|err| ClientError::Protocol {
            message: format!("failed to parse session list: {err}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_follow_the_configured_curve() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1000),
            max_attempts: 4,
        };
        let delays: Vec<u64> = (1..=4)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);

        // Further attempts cap at max_delay.
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(1000));
    }

    #[test]
    fn transient_classification() {
        assert!(
            ClientError::Connection {
                message: "refused".to_string()
            }
            .is_transient()
        );
        assert!(
            !ClientError::Server {
                code: ErrorCode::CapacityReached,
                message: "full".to_string()
            }
            .is_transient()
        );
        assert!(
            !ClientError::Protocol {
                message: "bad json".to_string()
            }
            .is_transient()
        );
    }

    #[tokio::test]
    async fn connect_to_missing_socket_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = match RelayClient::connect(&dir.path().join("absent.sock")).await {
            Ok(_) => panic!("connect should fail for a missing socket"),
            Err(err) => err,
        };
        assert!(err.is_transient());
    }
}
