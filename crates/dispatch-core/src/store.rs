//! Append-only, per-session event log with broadcast and replay.
//!
//! Reconnection support hinges on this store: a catching-up client gets
//! history first, then seamlessly switches to live updates, with the
//! boundary de-duplicated by `seq` comparison rather than timing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::event::{now_millis, Event, EventChannel};
use crate::session::SessionId;

/// Default per-session history budget (8 MB).
const DEFAULT_HISTORY_BYTES: usize = 8 * 1024 * 1024;

/// Live-subscriber channel depth. A receiver that falls this far behind
/// is lagged and its stream terminates with an explicit error instead of
/// silently skipping events.
const BROADCAST_CAPACITY: usize = 4096;

/// Store error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Replay was requested from a seq that retention has already pruned.
    #[error("history before seq {oldest_retained} is pruned; replay from {requested} unavailable")]
    HistoryUnavailable { requested: u64, oldest_retained: u64 },
    /// A live subscriber fell behind and missed `skipped` events.
    #[error("subscriber lagged; {skipped} events missed, re-attach to catch up")]
    Lagged { skipped: u64 },
}

struct StoredEvent {
    event: Event,
    bytes: usize,
}

struct LogInner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
    /// Next seq to assign; starts at 1.
    next_seq: u64,
    /// Seq of the oldest event retention still holds.
    oldest_retained: u64,
}

/// One session's log: monotonic counter, retained history, live fan-out.
struct SessionLog {
    inner: Mutex<LogInner>,
    sender: broadcast::Sender<Event>,
    history_bytes: usize,
}

impl SessionLog {
    fn new(history_bytes: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Mutex::new(LogInner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                next_seq: 1,
                oldest_retained: 1,
            }),
            sender,
            history_bytes,
        }
    }

    /// Assign the next seq and commit the event, atomically with the
    /// broadcast so subscribers never observe a gap at the snapshot
    /// boundary.
    fn append(
        &self,
        session_id: SessionId,
        channel: EventChannel,
        event_type: &str,
        payload: Value,
    ) -> Event {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let event = Event {
            session_id,
            seq: inner.next_seq,
            channel,
            event_type: event_type.to_owned(),
            payload,
            timestamp: now_millis(),
        };
        inner.next_seq += 1;

        let _ = self.sender.send(event.clone());

        let bytes = event.approx_bytes();
        while inner.total_bytes.saturating_add(bytes) > self.history_bytes {
            let Some(front) = inner.history.pop_front() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            inner.oldest_retained = front.event.seq + 1;
        }
        inner.history.push_back(StoredEvent {
            event: event.clone(),
            bytes,
        });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);

        event
    }

    fn latest_seq(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.next_seq - 1
    }

    /// Snapshot history after `from_seq` and subscribe to live updates in
    /// one critical section. Returns `(snapshot, receiver, watermark)`;
    /// live events at or below the watermark are duplicates of the
    /// snapshot and must be dropped.
    fn snapshot_from(
        &self,
        from_seq: u64,
    ) -> Result<(Vec<Event>, broadcast::Receiver<Event>, u64), StoreError> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let latest = inner.next_seq - 1;

        if from_seq < latest && from_seq + 1 < inner.oldest_retained {
            return Err(StoreError::HistoryUnavailable {
                requested: from_seq,
                oldest_retained: inner.oldest_retained,
            });
        }

        let receiver = self.sender.subscribe();
        let snapshot: Vec<Event> = inner
            .history
            .iter()
            .filter(|s| s.event.seq > from_seq)
            .map(|s| s.event.clone())
            .collect();

        Ok((snapshot, receiver, latest.max(from_seq)))
    }
}

/// Shared event store, partitioned by session id for writes.
///
/// Appends for different sessions never contend; within one session the
/// log's mutex is the single-writer discipline that makes `seq`
/// assignment a plain counter.
pub struct EventStore {
    logs: RwLock<HashMap<SessionId, Arc<SessionLog>>>,
    history_bytes: usize,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_budget(DEFAULT_HISTORY_BYTES)
    }

    /// Store with a custom per-session retention budget in bytes.
    #[must_use]
    pub fn with_history_budget(history_bytes: usize) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            history_bytes,
        }
    }

    fn log(&self, session_id: &SessionId) -> Arc<SessionLog> {
        if let Some(log) = self
            .logs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
        {
            return Arc::clone(log);
        }
        let mut logs = self
            .logs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            logs.entry(session_id.clone())
                .or_insert_with(|| Arc::new(SessionLog::new(self.history_bytes))),
        )
    }

    /// Append an event. The only way a `seq` is produced.
    pub fn append(
        &self,
        session_id: &SessionId,
        channel: EventChannel,
        event_type: &str,
        payload: Value,
    ) -> Event {
        let event = self
            .log(session_id)
            .append(session_id.clone(), channel, event_type, payload);
        tracing::trace!(
            session_id = %session_id,
            seq = event.seq,
            channel = channel.as_str(),
            "event appended"
        );
        event
    }

    /// Highest committed seq for the session; 0 when it has no events.
    #[must_use]
    pub fn latest_seq(&self, session_id: &SessionId) -> u64 {
        self.log(session_id).latest_seq()
    }

    /// Finite replay of retained history with `seq > from_seq`.
    ///
    /// Empty result (not an error) when nothing newer exists; explicit
    /// `HistoryUnavailable` when retention pruned part of the range.
    pub fn replay(
        &self,
        session_id: &SessionId,
        from_seq: u64,
    ) -> Result<Vec<Event>, StoreError> {
        let (snapshot, _receiver, _watermark) = self.log(session_id).snapshot_from(from_seq)?;
        Ok(snapshot)
    }

    /// Stream of all events with `seq > from_seq`: retained history first,
    /// then live updates, gap-free and duplicate-free at the boundary.
    ///
    /// The live receiver is registered before the history snapshot is
    /// taken (both under the log's lock), so nothing appended concurrently
    /// can fall between them; duplicates across the boundary are dropped
    /// by `seq` comparison against the snapshot watermark.
    pub fn subscribe_from(
        &self,
        session_id: &SessionId,
        from_seq: u64,
    ) -> Result<BoxStream<'static, Result<Event, StoreError>>, StoreError> {
        let (snapshot, receiver, watermark) = self.log(session_id).snapshot_from(from_seq)?;

        let history = futures::stream::iter(snapshot.into_iter().map(Ok));
        let live = BroadcastStream::new(receiver).filter_map(move |res| {
            futures::future::ready(match res {
                Ok(event) if event.seq > watermark => Some(Ok(event)),
                Ok(_) => None,
                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                    Some(Err(StoreError::Lagged { skipped: n }))
                }
            })
        });

        Ok(history.chain(live).boxed())
    }

    /// Live-only stream: everything after the current `latest_seq`.
    pub fn subscribe_live(
        &self,
        session_id: &SessionId,
    ) -> BoxStream<'static, Result<Event, StoreError>> {
        let latest = self.latest_seq(session_id);
        // Cannot hit HistoryUnavailable: from_seq == latest.
        self.subscribe_from(session_id, latest)
            .unwrap_or_else(|_| futures::stream::empty().boxed())
    }
}
