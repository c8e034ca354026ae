//! Single consumer of the bounded change-event queue. Fans each event out to
//! every subscribed handler, commits the resume token only after all of them
//! succeed, and halts on a poison event rather than silently skipping it.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::executor::BoundedExecutor;
use crate::handler::{HandlerRegistry, IndexHandler};
use crate::store::StateStore;
use crate::types::{ChangeEvent, SourceType};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ChangeEventProcessor {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn StateStore>,
    executor: BoundedExecutor,
    max_apply_attempts: u32,
    retry_backoff: Duration,
    metrics_every: u64,
}

impl ChangeEventProcessor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn StateStore>,
        config: &SyncConfig,
    ) -> Self {
        ChangeEventProcessor {
            registry,
            store,
            executor: BoundedExecutor::new(config.handler_parallelism),
            max_apply_attempts: config.max_apply_attempts,
            retry_backoff: config.retry_backoff(),
            metrics_every: config.metrics_every,
        }
    }

    /// Apply one event to every subscribed handler, then commit its resume
    /// token. Retries the whole fan-out on failure; handlers are idempotent
    /// by contract so re-applying to the survivors is harmless.
    pub async fn process_event(&self, event: &ChangeEvent) -> Result<()> {
        let handlers = self.registry.handlers_for(&event.source_type);

        if !handlers.is_empty() {
            let mut attempt = 1u32;
            loop {
                match self.fan_out(&handlers, event).await {
                    Ok(()) => break,
                    Err(e) if attempt < self.max_apply_attempts => {
                        tracing::warn!(
                            "Apply failed for {}/{} (attempt {}/{}): {}",
                            event.source_type,
                            event.entity_id,
                            attempt,
                            self.max_apply_attempts,
                            e
                        );
                        tokio::time::sleep(self.backoff(attempt)).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        // Full event content goes to the log; skipping it
                        // would silently corrupt index consistency.
                        tracing::error!(
                            "Poison event after {} attempts: {} — event: {}",
                            attempt,
                            e,
                            serde_json::to_string(event).unwrap_or_else(|_| "<unserializable>".into())
                        );
                        return Err(SyncError::PoisonEvent {
                            source_type: event.source_type.clone(),
                            entity_id: event.entity_id.clone(),
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        // Upsert, so a first-ever event still leaves a valid row.
        self.store
            .save_resume_token(&event.source_type, &event.resume_token)
            .await
    }

    /// Parallelism exists only across handlers of a single event, never
    /// across events; ordering per source type is the consumer loop's job.
    async fn fan_out(
        &self,
        handlers: &[Arc<dyn IndexHandler>],
        event: &ChangeEvent,
    ) -> Result<()> {
        let mut handles = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let handler = Arc::clone(handler);
            let event = event.clone();
            handles.push(
                self.executor
                    .submit(async move { handler.apply(&event).await })
                    .await,
            );
        }

        // Wait for every handler before reporting, so no write from this
        // event is still in flight when the caller moves on.
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    first_error.get_or_insert(SyncError::transient(
                        "handler task",
                        join_err.to_string(),
                    ));
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff * attempt;
        let jitter_ms = if self.retry_backoff.as_millis() > 1 {
            rand::thread_rng().gen_range(0..self.retry_backoff.as_millis() as u64 / 2)
        } else {
            0
        };
        base + Duration::from_millis(jitter_ms)
    }

    /// The single consumer loop for one sync session. Returns `Ok` on
    /// cancellation or queue close (clean drain), `Err` on the first poison
    /// event or store failure.
    pub async fn run(
        &self,
        rx: &mut mpsc::Receiver<ChangeEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::info!("Change event processor started");
        let mut processed: u64 = 0;
        let mut stats: HashMap<SourceType, LatencyStat> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Processor cancelled after {} events", processed);
                    return Ok(());
                }
                maybe = rx.recv() => {
                    let Some(event) = maybe else {
                        tracing::info!("Event queue closed after {} events, drain complete", processed);
                        return Ok(());
                    };

                    let started = Instant::now();
                    let source = event.source_type.clone();
                    self.process_event(&event).await?;

                    let stat = stats.entry(source).or_default();
                    stat.count += 1;
                    stat.total_micros += started.elapsed().as_micros();
                    processed += 1;

                    if self.metrics_every > 0 && processed % self.metrics_every == 0 {
                        for (source, stat) in &stats {
                            tracing::info!(
                                "[SYNC {}] {} events, avg apply {}µs",
                                source,
                                stat.count,
                                stat.total_micros / stat.count as u128
                            );
                        }
                        tracing::info!(
                            "[SYNC] queue depth {}, in-flight handlers {}",
                            rx.len(),
                            self.executor.in_flight()
                        );
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct LatencyStat {
    count: u64,
    total_micros: u128,
}
