//! Change-feed and primary-store collaborator seams.
//!
//! The upstream feed is an opaque ordered stream of [`ChangeEvent`]s with
//! resumable tokens; the primary entity reader is a finite snapshot scan.
//! The in-memory implementations back the integration tests and embedded
//! use — they are not production feed adapters.

use crate::error::{Result, SyncError};
use crate::types::{now_ms, ChangeEvent, ChangeType, ResumeToken, SourceEntity, SourceType};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Ordered, resumable stream of change notifications per source type.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription delivering every event strictly after `from`
    /// (or everything retained when `from` is `None`). Fails with
    /// [`SyncError::TokenTooOld`] when the position fell off the feed's
    /// retention window.
    async fn subscribe(
        &self,
        source_type: &str,
        from: Option<&str>,
    ) -> Result<mpsc::Receiver<ChangeEvent>>;

    /// Current tail position, used to establish resume baselines before a
    /// bulk rebuild. `None` when the feed has never emitted for this type.
    async fn latest_token(&self, source_type: &str) -> Result<Option<ResumeToken>>;
}

/// Finite snapshot scan over the primary store. A scan is not restartable
/// mid-way; callers start over from the beginning.
#[async_trait]
pub trait EntityReader: Send + Sync {
    async fn scan_all(&self, source_type: &str) -> Result<mpsc::Receiver<SourceEntity>>;
}

const SUBSCRIBER_BUFFER: usize = 1024;

struct FeedLog {
    events: Vec<ChangeEvent>,
    next_seq: u64,
    /// Token of the newest discarded event; subscriptions from before it
    /// are rejected as too old.
    trimmed_through: Option<ResumeToken>,
    live: broadcast::Sender<ChangeEvent>,
}

impl FeedLog {
    fn new() -> Self {
        let (live, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        FeedLog {
            events: Vec::new(),
            next_seq: 0,
            trimmed_through: None,
            live,
        }
    }
}

/// In-memory [`ChangeFeed`] with per-type ordered logs and live fan-out.
/// Tokens are zero-padded sequence numbers, opaque to the engine but
/// lexicographically ordered for the feed's own replay logic.
pub struct MemoryChangeFeed {
    logs: Arc<Mutex<HashMap<SourceType, FeedLog>>>,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        MemoryChangeFeed {
            logs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record an event and fan it out to live subscribers. Returns the token
    /// assigned to the event.
    pub fn publish(
        &self,
        source_type: &str,
        change_type: ChangeType,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> ResumeToken {
        let mut logs = self.logs.lock().unwrap();
        let log = logs
            .entry(source_type.to_string())
            .or_insert_with(FeedLog::new);

        log.next_seq += 1;
        let token = format!("{:012}", log.next_seq);
        let event = ChangeEvent {
            source_type: source_type.to_string(),
            change_type,
            entity_id: entity_id.to_string(),
            payload,
            resume_token: token.clone(),
            timestamp_ms: now_ms(),
        };

        log.events.push(event.clone());
        // No live subscribers is fine; replay covers late joiners.
        let _ = log.live.send(event);
        token
    }

    /// Discard all retained events for a source type, simulating the feed's
    /// retention window moving past old tokens.
    pub fn expire_history(&self, source_type: &str) {
        let mut logs = self.logs.lock().unwrap();
        if let Some(log) = logs.get_mut(source_type) {
            if let Some(last) = log.events.last() {
                log.trimmed_through = Some(last.resume_token.clone());
            }
            log.events.clear();
        }
    }
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(
        &self,
        source_type: &str,
        from: Option<&str>,
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        // Snapshot the replay set and attach to the live channel under one
        // lock so no event can slip between the two.
        let (replay, mut live) = {
            let mut logs = self.logs.lock().unwrap();
            let log = logs
                .entry(source_type.to_string())
                .or_insert_with(FeedLog::new);

            if let (Some(from), Some(trimmed)) = (from, log.trimmed_through.as_deref()) {
                if from < trimmed {
                    return Err(SyncError::TokenTooOld(source_type.to_string()));
                }
            }

            let replay: Vec<ChangeEvent> = log
                .events
                .iter()
                .filter(|e| match from {
                    Some(from) => e.resume_token.as_str() > from,
                    None => true,
                })
                .cloned()
                .collect();
            (replay, log.live.subscribe())
        };

        let logs = Arc::clone(&self.logs);
        let source = source_type.to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            let mut last_sent: Option<ResumeToken> = None;
            for event in replay {
                last_sent = Some(event.resume_token.clone());
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        // Events published during replay arrive on both paths.
                        if let Some(ref last) = last_sent {
                            if event.resume_token.as_str() <= last.as_str() {
                                continue;
                            }
                        }
                        last_sent = Some(event.resume_token.clone());
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The broadcast ring overwrote events this subscriber
                        // had not read yet; recover them from the log so the
                        // stream stays gapless.
                        tracing::warn!(
                            "memory feed subscriber for '{}' lagged by {} events, replaying from log",
                            source,
                            skipped
                        );
                        let missed: Vec<ChangeEvent> = {
                            let logs = logs.lock().unwrap();
                            logs.get(&source)
                                .map(|log| {
                                    log.events
                                        .iter()
                                        .filter(|e| match last_sent.as_deref() {
                                            Some(last) => e.resume_token.as_str() > last,
                                            None => true,
                                        })
                                        .cloned()
                                        .collect()
                                })
                                .unwrap_or_default()
                        };
                        for event in missed {
                            last_sent = Some(event.resume_token.clone());
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }

    async fn latest_token(&self, source_type: &str) -> Result<Option<ResumeToken>> {
        let logs = self.logs.lock().unwrap();
        Ok(logs.get(source_type).and_then(|log| {
            log.events
                .last()
                .map(|e| e.resume_token.clone())
                .or_else(|| log.trimmed_through.clone())
        }))
    }
}

/// In-memory [`EntityReader`]. The optional per-entity delay lets tests hold
/// a bulk-rebuild window open while concurrent changes arrive.
pub struct MemoryEntityReader {
    entities: Mutex<HashMap<SourceType, BTreeMap<String, serde_json::Value>>>,
    scan_delay: Mutex<Duration>,
}

impl MemoryEntityReader {
    pub fn new() -> Self {
        MemoryEntityReader {
            entities: Mutex::new(HashMap::new()),
            scan_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn insert(&self, source_type: &str, id: &str, data: serde_json::Value) {
        self.entities
            .lock()
            .unwrap()
            .entry(source_type.to_string())
            .or_default()
            .insert(id.to_string(), data);
    }

    pub fn remove(&self, source_type: &str, id: &str) {
        if let Some(map) = self.entities.lock().unwrap().get_mut(source_type) {
            map.remove(id);
        }
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        *self.scan_delay.lock().unwrap() = delay;
    }
}

impl Default for MemoryEntityReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityReader for MemoryEntityReader {
    async fn scan_all(&self, source_type: &str) -> Result<mpsc::Receiver<SourceEntity>> {
        // Snapshot at scan start; a new scan always restarts from scratch.
        let snapshot: Vec<SourceEntity> = self
            .entities
            .lock()
            .unwrap()
            .get(source_type)
            .map(|map| {
                map.iter()
                    .map(|(id, data)| SourceEntity {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let delay = *self.scan_delay.lock().unwrap();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for entity in snapshot {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(entity).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
