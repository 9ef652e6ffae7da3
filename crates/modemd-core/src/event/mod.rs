//! # Kernel event bus
//!
//! Routes kernel uevents to handlers keyed by subsystem name. The receive
//! loop only parses and enqueues; handlers run on a small pool of named
//! worker threads fed by a bounded queue, so a slow handler never stalls
//! the socket and an event storm cannot spawn unbounded work.
//!
//! ```text
//!   netlink ──► receive() ──► parse ──► lookup(subsystem) ──► queue ──► workers
//! ```

pub mod modem_ctrl;
pub mod netlink;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::error::EventBusError;
use crate::props::atoi;

/// Records this long or longer are truncated by the kernel and dropped.
pub const UEVENT_MSG_LEN: usize = 4096;

// ─── Events ─────────────────────────────────────────────────────────────────

/// One parsed uevent. Missing text keys are empty, missing numbers `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UEvent {
    pub action: String,
    pub devpath: String,
    pub subsystem: String,
    pub firmware: String,
    pub major: i32,
    pub minor: i32,
    pub modem_event: String,
    pub modem_stat: i32,
}

impl Default for UEvent {
    fn default() -> Self {
        Self {
            action: String::new(),
            devpath: String::new(),
            subsystem: String::new(),
            firmware: String::new(),
            major: -1,
            minor: -1,
            modem_event: String::new(),
            modem_stat: -1,
        }
    }
}

fn parse_int(value: &str) -> i32 {
    if value.trim_start().starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+') {
        i32::try_from(atoi(value)).unwrap_or(-1)
    } else {
        -1
    }
}

impl UEvent {
    /// Parse a NUL-separated `KEY=value` record. Unknown keys are ignored;
    /// parsing stops at the first empty field.
    pub fn parse(raw: &[u8]) -> Self {
        let mut ev = Self::default();
        for field in raw.split(|&b| b == 0) {
            if field.is_empty() {
                break;
            }
            let field = String::from_utf8_lossy(field);
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key {
                "ACTION" => ev.action = value.to_string(),
                "DEVPATH" => ev.devpath = value.to_string(),
                "SUBSYSTEM" => ev.subsystem = value.to_string(),
                "FIRMWARE" => ev.firmware = value.to_string(),
                "MAJOR" => ev.major = parse_int(value),
                "MINOR" => ev.minor = parse_int(value),
                "MODEM_EVENT" => ev.modem_event = value.to_string(),
                "MODEM_STAT" => ev.modem_stat = parse_int(value),
                _ => {}
            }
        }
        ev
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &UEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&UEvent) + Send + Sync,
{
    fn handle(&self, event: &UEvent) {
        self(event)
    }
}

struct Job {
    handler: Arc<dyn EventHandler>,
    event: UEvent,
}

// ─── Bus ────────────────────────────────────────────────────────────────────

pub struct EventBus {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    capacity: usize,
    queue: Sender<Job>,
}

fn run_worker(id: usize, jobs: Receiver<Job>) {
    for job in jobs.iter() {
        tracing::debug!(worker = id, subsystem = %job.event.subsystem, "handling uevent");
        job.handler.handle(&job.event);
    }
}

impl EventBus {
    /// Create the bus with room for `capacity` handlers and spawn `workers`
    /// threads draining a queue of `queue_len` events.
    pub fn new(capacity: usize, workers: usize, queue_len: usize) -> io::Result<Self> {
        let (tx, rx) = bounded(queue_len);
        for id in 0..workers {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("uevent-worker-{id}"))
                .spawn(move || run_worker(id, rx))
                .map_err(io::Error::other)?;
        }
        tracing::info!(capacity, workers, queue_len, "event bus ready");
        Ok(Self {
            handlers: RwLock::new(HashMap::new()),
            capacity,
            queue: tx,
        })
    }

    pub fn register(
        &self,
        subsystem: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), EventBusError> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(subsystem) {
            return Err(EventBusError::Duplicate(subsystem.to_string()));
        }
        if handlers.len() >= self.capacity {
            return Err(EventBusError::Full(self.capacity));
        }
        handlers.insert(subsystem.to_string(), handler);
        tracing::info!(subsystem, "event handler registered");
        Ok(())
    }

    pub fn unregister(&self, subsystem: &str) -> Result<(), EventBusError> {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(subsystem);
        match removed {
            Some(_) => {
                tracing::info!(subsystem, "event handler unregistered");
                Ok(())
            }
            None => Err(EventBusError::NotRegistered(subsystem.to_string())),
        }
    }

    /// Queue `event` for its subsystem's handler. Returns whether it was
    /// queued; events without a handler, or arriving while the queue is
    /// full, are dropped.
    pub fn dispatch(&self, event: UEvent) -> bool {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.subsystem)
            .cloned();
        let Some(handler) = handler else {
            tracing::trace!(subsystem = %event.subsystem, "no handler for uevent");
            return false;
        };
        match self.queue.try_send(Job { handler, event }) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                tracing::error!(subsystem = %job.event.subsystem, "uevent queue full, event dropped");
                false
            }
            Err(TrySendError::Disconnected(job)) => {
                tracing::error!(subsystem = %job.event.subsystem, "uevent workers gone");
                false
            }
        }
    }

    /// Entry point for one raw record from the kernel.
    pub fn receive(&self, raw: &[u8]) -> bool {
        if raw.len() >= UEVENT_MSG_LEN {
            tracing::warn!(len = raw.len(), "oversized uevent discarded");
            return false;
        }
        self.dispatch(UEvent::parse(raw))
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("EventBus")
            .field("handlers", &handlers.keys().collect::<Vec<_>>())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
