// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process queue transport and stage runner.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::settings::ConcurrencyBounds;
use crate::error::{Error, Result};

/// Sending side of a stage queue.
#[derive(Debug)]
pub struct QueueSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue without waiting. A full or closed queue refuses the message.
    pub fn send(&self, message: T) -> Result<()> {
        self.tx
            .try_send(message)
            .map_err(|e| Error::Queue(format!("{} queue refused message: {}", self.name, e)))
    }

    /// Queue name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Create a bounded stage queue.
pub fn channel<T>(name: &'static str, capacity: usize) -> (QueueSender<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { name, tx }, rx)
}

/// Handles messages of one stage.
///
/// Implementations swallow their own errors; nothing is returned to the
/// transport.
#[async_trait]
pub trait StageConsumer<T>: Send + Sync + 'static {
    /// Process one message.
    async fn consume(&self, message: T);
}

/// Drains a stage queue into a bounded set of workers.
pub struct StageRunner<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
    bounds: watch::Receiver<ConcurrencyBounds>,
    consumer: Arc<dyn StageConsumer<T>>,
    shutdown: Arc<Notify>,
}

impl<T: Send + 'static> StageRunner<T> {
    /// Create a runner.
    pub fn new(
        name: &'static str,
        rx: mpsc::Receiver<T>,
        bounds: watch::Receiver<ConcurrencyBounds>,
        consumer: Arc<dyn StageConsumer<T>>,
    ) -> Self {
        Self {
            name,
            rx,
            bounds,
            consumer,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown or until every sender is gone.
    ///
    /// In-flight messages are allowed to finish before returning.
    pub async fn run(mut self) {
        info!(stage = self.name, max = self.bounds.borrow().max, "Stage started");
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            let max = self.bounds.borrow().max.max(1);

            if workers.len() >= max {
                tokio::select! {
                    biased;

                    _ = self.shutdown.notified() => {
                        info!(stage = self.name, "Stage received shutdown signal");
                        break;
                    }

                    Some(result) = workers.join_next() => {
                        self.reap(result);
                    }
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(stage = self.name, "Stage received shutdown signal");
                    break;
                }

                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    self.reap(result);
                }

                message = self.rx.recv() => {
                    match message {
                        Some(message) => {
                            let consumer = self.consumer.clone();
                            workers.spawn(async move {
                                consumer.consume(message).await;
                            });
                            debug!(stage = self.name, active = workers.len(), "Message dispatched");
                        }
                        None => {
                            debug!(stage = self.name, "Stage queue closed");
                            break;
                        }
                    }
                }
            }
        }

        while let Some(result) = workers.join_next().await {
            self.reap(result);
        }
        info!(stage = self.name, "Stage stopped");
    }

    fn reap(&self, result: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = result {
            error!(stage = self.name, error = %e, "Stage worker panicked");
        }
    }
}
