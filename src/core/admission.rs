//! Admission control: a bounded request queue plus a concurrency cap
//!
//! The queue counts every admitted request that has not completed, whether
//! it is still waiting for a concurrency slot or already executing. Admission
//! is a compare-and-swap on that count, so `max_queue_size` holds exactly
//! under concurrent callers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::HubError;

/// Whether `max_concurrent_requests` applies hub-wide or per server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    #[default]
    #[serde(alias = "GLOBAL")]
    Global,
    #[serde(alias = "PER_SERVER")]
    PerServer,
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_queue_size: usize,
    pub max_concurrent_requests: usize,
    pub scope: ConcurrencyScope,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_concurrent_requests: 100,
            scope: ConcurrencyScope::Global,
        }
    }
}

/// Admission statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionStats {
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub rejected: u64,
    pub closed: bool,
}

pub struct AdmissionController {
    config: AdmissionConfig,
    queued: AtomicUsize,
    rejected: AtomicU64,
    closed: AtomicBool,
    global: Arc<Semaphore>,
    per_server: Mutex<HashMap<String, Arc<Semaphore>>>,
    drained: Notify,
    abort: watch::Sender<bool>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        let permits = config.max_concurrent_requests.max(1);
        let (abort, _) = watch::channel(false);
        Self {
            global: Arc::new(Semaphore::new(permits)),
            per_server: Mutex::new(HashMap::new()),
            queued: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
            abort,
            config,
        }
    }

    /// Admit one request or reject it synchronously
    pub fn try_admit(self: &Arc<Self>) -> Result<RequestTicket, HubError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::ShuttingDown);
        }

        let max = self.config.max_queue_size;
        let admitted = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1));

        match admitted {
            Ok(_) => Ok(RequestTicket {
                controller: Arc::clone(self),
            }),
            Err(current) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(queue_size = current, capacity = max, "Request rejected, queue full");
                Err(HubError::QueueFull { capacity: max })
            }
        }
    }

    fn semaphore_for(&self, server: &str) -> Arc<Semaphore> {
        if self.config.scope == ConcurrencyScope::Global {
            return Arc::clone(&self.global);
        }
        let Ok(mut map) = self.per_server.lock() else {
            return Arc::clone(&self.global);
        };
        let semaphore = map.entry(server.to_string()).or_insert_with(|| {
            let semaphore = Semaphore::new(self.config.max_concurrent_requests.max(1));
            if self.closed.load(Ordering::Acquire) {
                semaphore.close();
            }
            Arc::new(semaphore)
        });
        Arc::clone(semaphore)
    }

    /// Wait for a concurrency slot to execute against `server`
    pub async fn acquire_slot(&self, server: &str) -> Result<OwnedSemaphorePermit, HubError> {
        self.semaphore_for(server)
            .acquire_owned()
            .await
            .map_err(|_| HubError::ShuttingDown)
    }

    /// Drop the per-server slot pool of a removed server
    pub fn forget_server(&self, server: &str) {
        if let Ok(mut map) = self.per_server.lock() {
            map.remove(server);
        }
    }

    /// Run `fut`, abandoning it with `ShuttingDown` if the hub aborts
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, HubError>
    where
        F: Future<Output = Result<T, HubError>>,
    {
        let mut abort = self.abort.subscribe();
        if *abort.borrow() {
            return Err(HubError::ShuttingDown);
        }
        tokio::select! {
            result = fut => result,
            _ = abort.wait_for(|aborted| *aborted) => Err(HubError::ShuttingDown),
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            queue_size: self.queue_size(),
            max_queue_size: self.config.max_queue_size,
            rejected: self.rejected(),
            closed: self.is_closed(),
        }
    }

    /// Stop admitting new requests; admitted ones continue
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Wait until every admitted request completed, up to `grace`.
    /// Returns whether the queue drained in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.queue_size() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }

    /// Fail every request still queued or executing with `ShuttingDown`
    pub fn abort(&self) {
        let remaining = self.queue_size();
        if remaining > 0 {
            warn!(remaining, "Aborting requests still pending after grace period");
        }
        self.abort.send_replace(true);
        self.global.close();
        if let Ok(map) = self.per_server.lock() {
            for semaphore in map.values() {
                semaphore.close();
            }
        }
    }

    fn release(&self) {
        if self.queued.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// One admitted request; leaves the queue when dropped
pub struct RequestTicket {
    controller: Arc<AdmissionController>,
}

impl Drop for RequestTicket {
    fn drop(&mut self) {
        self.controller.release();
    }
}
