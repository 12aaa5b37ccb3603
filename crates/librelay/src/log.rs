use std::collections::VecDeque;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::warn;

use relay_protocol::{Channel, LogEntry, now_epoch_ms};

/// Replay/live-tail sequence of one subscriber. Owns its cursor; dropping
/// it tears down the live-phase broadcast receiver.
pub type EntryStream = Pin<Box<dyn Stream<Item = LogEntry> + Send + 'static>>;

/// Publish attempted on a sealed log.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event log is sealed")]
pub struct LogSealed;

/// Requested replay offset predates the retained window.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("replay window exceeded: requested {requested}, oldest retained {oldest}")]
pub struct ReplayWindowExceeded {
    pub requested: u64,
    pub oldest: u64,
}

/// Append-only, offset-ordered event record for one session.
///
/// Offsets are contiguous from 0 in publish order; retention is a bounded
/// ring. Fan-out is a shared broadcast channel; `subscribe` snapshots the
/// replay range and the receiver together so the replay/live boundary has
/// no gap and no duplicate.
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    next_offset: u64,
    tx: Option<broadcast::Sender<LogEntry>>,
}

impl EventLog {
    pub fn new(max_entries: usize, broadcast_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            entries: VecDeque::with_capacity(max_entries.max(1).min(1024)),
            max_entries: max_entries.max(1),
            next_offset: 0,
            tx: Some(tx),
        }
    }

    /// Append one event, assign it the next offset, and fan it out.
    ///
    /// Callers must be serialized per session (the registry holds the
    /// session lock); that is what makes offsets match publish order.
    pub fn publish(
        &mut self,
        channel: Channel,
        data: serde_json::Value,
    ) -> Result<LogEntry, LogSealed> {
        let Some(tx) = &self.tx else {
            return Err(LogSealed);
        };

        let entry = LogEntry {
            offset: self.next_offset,
            channel,
            timestamp_epoch_ms: now_epoch_ms(),
            data,
        };
        self.next_offset += 1;

        self.entries.push_back(entry.clone());
        while self.entries.len() > self.max_entries {
            let _ = self.entries.pop_front();
        }

        // Send only fails when no receiver is live; entries are still
        // retained for replay.
        let _ = tx.send(entry.clone());
        Ok(entry)
    }

    /// Offset of the most recently published entry.
    pub fn head_offset(&self) -> Option<u64> {
        self.next_offset.checked_sub(1)
    }

    /// Oldest offset still retained for replay.
    pub fn oldest_retained(&self) -> Option<u64> {
        self.entries.front().map(|e| e.offset)
    }

    pub fn is_sealed(&self) -> bool {
        self.tx.is_none()
    }

    /// Stop accepting publishes and end every live tail after it drains.
    pub fn seal(&mut self) {
        self.tx = None;
    }

    /// Replay from `from_offset` (inclusive), then live-tail. `None`
    /// skips replay entirely. Subscribing past the head is a well-defined
    /// "anything from now on" and yields an empty-then-live sequence.
    pub fn subscribe(
        &self,
        from_offset: Option<u64>,
    ) -> Result<EntryStream, ReplayWindowExceeded> {
        let replay: Vec<LogEntry> = match from_offset {
            None => Vec::new(),
            Some(from) => {
                let earliest = self.oldest_retained().unwrap_or(self.next_offset);
                if from < earliest {
                    return Err(ReplayWindowExceeded {
                        requested: from,
                        oldest: earliest,
                    });
                }
                self.entries
                    .iter()
                    .filter(|e| e.offset >= from)
                    .cloned()
                    .collect()
            }
        };

        // Everything below this offset is covered by the replay snapshot;
        // the receiver is created under the same registry lock, so entries
        // published later arrive with offset >= snapshot_next.
        let snapshot_next = self.next_offset;
        let rx = self.tx.as_ref().map(broadcast::Sender::subscribe);

        Ok(Box::pin(async_stream::stream! {
            for entry in replay {
                yield entry;
            }
            if let Some(mut rx) = rx {
                loop {
                    match rx.recv().await {
                        Ok(entry) => {
                            if entry.offset < snapshot_next {
                                continue;
                            }
                            yield entry;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // A lagged tail has a hole we cannot repair
                            // from here; end the stream so the consumer
                            // resumes from its own cursor.
                            warn!(skipped, "subscriber lagged, ending stream");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::ChunkData;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn chunk(text: &str) -> serde_json::Value {
        serde_json::to_value(ChunkData {
            text: text.to_string(),
            done: false,
        })
        .unwrap()
    }

    async fn next_entry(stream: &mut EntryStream) -> LogEntry {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream produced no entry in time")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn offsets_are_contiguous_from_zero() {
        let mut log = EventLog::new(100, 16);
        for i in 0..5u64 {
            let entry = log.publish(Channel::Chunk, chunk("x")).unwrap();
            assert_eq!(entry.offset, i);
        }
        assert_eq!(log.head_offset(), Some(4));
        assert_eq!(log.oldest_retained(), Some(0));
    }

    #[tokio::test]
    async fn replay_from_k_equals_full_sequence_minus_prefix() {
        let mut log = EventLog::new(100, 16);
        for i in 0..6 {
            log.publish(Channel::Chunk, chunk(&format!("{i}"))).unwrap();
        }

        let mut from_zero = log.subscribe(Some(0)).unwrap();
        let mut from_three = log.subscribe(Some(3)).unwrap();

        let mut full = Vec::new();
        for _ in 0..6 {
            full.push(next_entry(&mut from_zero).await);
        }
        for expected in full.iter().skip(3) {
            let got = next_entry(&mut from_three).await;
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn replay_then_live_has_no_gap_and_no_duplicate() {
        let mut log = EventLog::new(100, 16);
        log.publish(Channel::Chunk, chunk("a")).unwrap();
        log.publish(Channel::Chunk, chunk("b")).unwrap();

        let mut stream = log.subscribe(Some(1)).unwrap();
        log.publish(Channel::Chunk, chunk("c")).unwrap();

        assert_eq!(next_entry(&mut stream).await.offset, 1);
        assert_eq!(next_entry(&mut stream).await.offset, 2);
    }

    #[tokio::test]
    async fn subscribe_past_head_is_empty_then_live() {
        let mut log = EventLog::new(100, 16);
        log.publish(Channel::Chunk, chunk("a")).unwrap();

        let mut stream = log.subscribe(Some(10)).unwrap();
        let entry = log.publish(Channel::Chunk, chunk("b")).unwrap();
        assert_eq!(entry.offset, 1);

        // Nothing replayed; the first delivery is the live entry.
        assert_eq!(next_entry(&mut stream).await.offset, 1);
    }

    #[tokio::test]
    async fn subscribe_without_offset_is_live_only() {
        let mut log = EventLog::new(100, 16);
        log.publish(Channel::Chunk, chunk("a")).unwrap();

        let mut stream = log.subscribe(None).unwrap();
        log.publish(Channel::Chunk, chunk("b")).unwrap();
        assert_eq!(next_entry(&mut stream).await.offset, 1);
    }

    #[tokio::test]
    async fn eviction_bounds_replay_window() {
        let mut log = EventLog::new(2, 16);
        for _ in 0..5 {
            log.publish(Channel::Chunk, chunk("x")).unwrap();
        }
        assert_eq!(log.oldest_retained(), Some(3));

        let err = log.subscribe(Some(0)).err().unwrap();
        assert_eq!(
            err,
            ReplayWindowExceeded {
                requested: 0,
                oldest: 3
            }
        );

        // The retained suffix is still replayable.
        let mut stream = log.subscribe(Some(3)).unwrap();
        assert_eq!(next_entry(&mut stream).await.offset, 3);
        assert_eq!(next_entry(&mut stream).await.offset, 4);
    }

    #[tokio::test]
    async fn sealed_log_rejects_publish_and_ends_streams() {
        let mut log = EventLog::new(100, 16);
        log.publish(Channel::Chunk, chunk("a")).unwrap();
        log.seal();

        assert_eq!(log.publish(Channel::Chunk, chunk("b")), Err(LogSealed));

        let mut stream = log.subscribe(Some(0)).unwrap();
        assert_eq!(next_entry(&mut stream).await.offset, 0);
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream should end promptly");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn independent_cursors_do_not_interfere() {
        let mut log = EventLog::new(100, 16);
        log.publish(Channel::Chunk, chunk("a")).unwrap();

        let mut one = log.subscribe(Some(0)).unwrap();
        let mut two = log.subscribe(Some(0)).unwrap();

        // Drain one cursor fully; the other still replays from 0.
        assert_eq!(next_entry(&mut one).await.offset, 0);
        log.publish(Channel::Chunk, chunk("b")).unwrap();
        assert_eq!(next_entry(&mut one).await.offset, 1);

        assert_eq!(next_entry(&mut two).await.offset, 0);
        assert_eq!(next_entry(&mut two).await.offset, 1);
    }
}
