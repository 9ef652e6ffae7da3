//! # Client bus
//!
//! Local stream socket that fans modem lifecycle messages out to every
//! subscriber (radio stack, log collector, audio, ...). Two threads serve
//! it:
//!
//! ```text
//!   accept ──► slot table ◄── broadcast (writer lock) ◄── monitors
//!                 │
//!   reader ◄──────┘  poll(clients + wake pipe)
//!     │
//!     └─► "Modem Blocked" / dump progress / "AGDSP Assert"
//! ```
//!
//! Every broadcast first runs [`ClientBus::process_message`] under the
//! writer lock, so the state side effects of a message and its fan-out are
//! atomic with respect to other broadcasts. Delivery is best effort: a
//! client whose write fails (or would block) is dropped on the spot.

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::context::{ControlRequest, ModemContext};
use crate::diag;
use crate::hw::poll;
use crate::props;
use crate::state::ModemState;

// ─── Messages ───────────────────────────────────────────────────────────────

pub const MODEM_ALIVE: &str = "Modem Alive";
pub const MODEM_ASSERT: &str = "Modem Assert";
pub const MODEM_RESET: &str = "Modem Reset";
pub const MODEM_BLOCKED: &str = "Modem Blocked";
pub const PREPARE_RESET: &str = "Prepare Reset";
pub const MODEM_NOT_ALIVE: &str = "Modem Assert: modem not alive!";
pub const MINIAP_PANIC: &str = "Miniap Panic";
pub const P_ARM_ASSERT: &str = "P-ARM Modem Assert";
pub const AGDSP_ASSERT: &str = "AGDSP Assert";
pub const HUNG: &str = "HUNG";
pub const DUMP_BEGIN: &str = "SLOGMODEM DUMP BEGIN";
pub const DUMP_ONGOING: &str = "SLOGMODEM DUMP ONGOING";
pub const DUMP_COMPLETE: &str = "SLOGMODEM DUMP COMPLETE";

const CLIENT_READ_BUF: usize = 128;

/// Text view of a raw message, stopping at the first NUL.
pub fn message_text(raw: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end])
}

// ─── Socket ─────────────────────────────────────────────────────────────────

/// Bind the listening socket. A leading `@` selects the abstract namespace;
/// anything else is a filesystem path, replacing a stale socket file.
pub fn bind(name: &str) -> io::Result<UnixListener> {
    match name.strip_prefix('@') {
        Some(abstract_name) => {
            let addr = SocketAddr::from_abstract_name(abstract_name.as_bytes())?;
            UnixListener::bind_addr(&addr)
        }
        None => {
            let path = Path::new(name);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            UnixListener::bind(path)
        }
    }
}

// ─── Slots ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Client {
    id: u64,
    stream: Arc<UnixStream>,
}

#[derive(Debug)]
struct Slots {
    clients: Vec<Option<Client>>,
    next_id: u64,
}

impl Slots {
    fn evict(&mut self, index: usize, why: &str) {
        if let Some(client) = self.clients[index].take() {
            tracing::info!(slot = index, client = client.id, why, "client dropped");
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Progress of a modem dump as reported by the log collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpPhase {
    Begin,
    Ongoing,
    Complete,
}

/// Per-reader bookkeeping carried between client messages.
#[derive(Debug, Default)]
pub struct ReaderState {
    pub dump: Option<DumpPhase>,
    /// A blocked modem is waiting for its dump before being reset.
    pub later_reset: bool,
}

// ─── Bus ────────────────────────────────────────────────────────────────────

pub struct ClientBus {
    ctx: Arc<ModemContext>,
    // The writer lock: guards the slot table and serialises broadcasts.
    slots: Mutex<Slots>,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
}

impl ClientBus {
    pub fn new(ctx: Arc<ModemContext>) -> io::Result<Arc<Self>> {
        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        wake_rx.set_nonblocking(true)?;
        let capacity = ctx.config.daemon.max_clients;
        Ok(Arc::new(Self {
            ctx,
            slots: Mutex::new(Slots {
                clients: (0..capacity).map(|_| None).collect(),
                next_id: 0,
            }),
            wake_tx,
            wake_rx,
        }))
    }

    pub fn context(&self) -> &Arc<ModemContext> {
        &self.ctx
    }

    /// Spawn the accept and reader threads.
    pub fn start(self: &Arc<Self>, listener: UnixListener) -> io::Result<()> {
        let bus = Arc::clone(self);
        thread::Builder::new()
            .name("client-accept".into())
            .spawn(move || bus.accept_loop(listener))
            .map_err(io::Error::other)?;

        let bus = Arc::clone(self);
        thread::Builder::new()
            .name("client-reader".into())
            .spawn(move || bus.read_loop())
            .map_err(io::Error::other)?;
        Ok(())
    }

    fn accept_loop(&self, listener: UnixListener) {
        tracing::info!("client bus accepting");
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    if let Err(e) = self.add_client(stream) {
                        tracing::warn!(error = %e, "register client");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "accept"),
            }
        }
    }

    /// Take a slot for `stream` (evicting the oldest client when full) and
    /// tell it the current modem state. Returns the slot index.
    pub fn add_client(&self, stream: UnixStream) -> io::Result<usize> {
        stream.set_nonblocking(true)?;
        let index = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let index = match slots.clients.iter().position(Option::is_none) {
                Some(free) => free,
                None => {
                    let oldest = slots
                        .clients
                        .iter()
                        .enumerate()
                        .filter_map(|(i, c)| c.as_ref().map(|c| (i, c.id)))
                        .min_by_key(|&(_, id)| id)
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    slots.evict(oldest, "client table full");
                    oldest
                }
            };
            let id = slots.next_id;
            slots.next_id += 1;

            let mut line = self.ctx.state.get().status_line().as_bytes().to_vec();
            line.push(0);
            if let Err(e) = (&stream).write_all(&line) {
                tracing::warn!(client = id, error = %e, "send state line");
            }
            slots.clients[index] = Some(Client {
                id,
                stream: Arc::new(stream),
            });
            tracing::info!(slot = index, client = id, "client connected");
            index
        };
        self.wake_reader();
        Ok(index)
    }

    fn wake_reader(&self) {
        if let Err(e) = (&self.wake_tx).write(b"0") {
            if e.kind() != ErrorKind::WouldBlock {
                tracing::warn!(error = %e, "wake client reader");
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clients
            .iter()
            .filter(|c| c.is_some())
            .count()
    }

    /// Run the state side effects of `msg`, then deliver it to every
    /// client. Returns how many clients accepted the write.
    pub fn broadcast(&self, msg: &[u8]) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.process_message(&message_text(msg));

        let mut delivered = 0;
        for index in 0..slots.clients.len() {
            let Some(client) = &slots.clients[index] else {
                continue;
            };
            match (&*client.stream).write(msg) {
                Ok(n) if n == msg.len() => {
                    tracing::debug!(slot = index, client = client.id, bytes = n, "broadcast");
                    delivered += 1;
                }
                // The peer would see a truncated message; drop it instead.
                Ok(n) => {
                    tracing::warn!(slot = index, client = client.id, written = n, bytes = msg.len(), "short client write");
                    slots.evict(index, "short write");
                }
                Err(e) => {
                    tracing::warn!(slot = index, client = client.id, error = %e, "client write failed");
                    slots.evict(index, "write failed");
                }
            }
        }
        delivered
    }

    /// Policy attached to outgoing messages. Runs under the writer lock.
    fn process_message(&self, msg: &str) {
        tracing::debug!(msg, "process message");
        let ctx = &self.ctx;
        if msg.contains(MODEM_ALIVE) {
            ctx.state.set(ModemState::Alive);
            ctx.set_aux_service(true);
            if ctx.props.get_or(props::WIFI_ONLY, "false") == "true" {
                self.cache_imei();
            }
        } else if msg.contains(MODEM_ASSERT) {
            if msg.contains(P_ARM_ASSERT) {
                tracing::info!("p-arm assert, next assert is the same fault");
                ctx.suppress_next_assert();
                return;
            }
            if ctx.take_assert_suppression() {
                tracing::info!("assert follows p-arm assert, skipped");
                return;
            }
            ctx.state.set(ModemState::Assert);
            ctx.set_aux_service(false);
            let reset = ctx.reset_enabled();
            let dump = ctx.save_dump_enabled();
            tracing::info!(reset, dump, "modem assert");
            if reset {
                if dump {
                    self.spawn_dump_wait();
                } else {
                    ctx.request(ControlRequest::PrepareReset);
                }
            }
        } else if msg.contains(MODEM_RESET) {
            ctx.set_aux_service(false);
            ctx.request(ControlRequest::ModemReset);
        }
    }

    fn cache_imei(&self) {
        let ctx = &self.ctx;
        if ctx.props.get(props::WIFI_ONLY_IMEI).is_some_and(|v| !v.is_empty()) {
            return;
        }
        let tty = &ctx.config.paths.imei_tty;
        match diag::read_imei(tty, ctx.timings().imei_timeout) {
            Ok(Some(imei)) => {
                tracing::info!("wifi-only imei cached");
                ctx.props.set(props::WIFI_ONLY_IMEI, &imei);
            }
            Ok(None) => tracing::warn!(tty = %tty.display(), "empty imei reply"),
            Err(e) => tracing::error!(tty = %tty.display(), error = %e, "read imei"),
        }
    }

    /// Wait for the log collector to finish the dump (or give up), then ask
    /// for a reset.
    fn spawn_dump_wait(&self) {
        let ctx = Arc::clone(&self.ctx);
        ctx.dump.arm();
        let spawned = thread::Builder::new()
            .name("dump-wait".into())
            .spawn(move || {
                let wait = ctx.timings().dump_wait;
                tracing::info!(wait_ms = wait.as_millis() as u64, "waiting for dump");
                let completed = ctx.dump.wait(wait);
                tracing::info!(completed, "dump wait over, preparing reset");
                ctx.request(ControlRequest::PrepareReset);
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "spawn dump waiter, resetting now");
            self.ctx.request(ControlRequest::PrepareReset);
        }
    }

    /// A client reported the modem as blocked. Returns whether the reset
    /// has to wait for a dump to complete.
    pub fn dispatch_blocked(&self) -> bool {
        let ctx = &self.ctx;
        if !ctx.state.transition(ModemState::Alive, ModemState::Assert) {
            tracing::info!(state = %ctx.state.get(), "block report ignored");
            return false;
        }
        ctx.request(ControlRequest::ModemBlocked);
        let _wake = ctx.wake_lock.acquire("modem blocked");

        let loop_dev = ctx.props.get_or(props::LOOP_DEV, props::DEFAULT_LOOP_DEV);
        match diag::loopback_test(Path::new(&loop_dev), ctx.timings().loopback_settle) {
            Ok(true) => tracing::info!(dev = %loop_dev, "loopback ok"),
            Ok(false) => tracing::warn!(dev = %loop_dev, "loopback echo mismatch"),
            Err(e) => tracing::error!(dev = %loop_dev, error = %e, "loopback test"),
        }

        let dump = ctx.save_dump_enabled();
        if dump {
            // Let the CP assert and flush its caches to DDR.
            thread::sleep(ctx.timings().blocked_dump_settle);
        }

        tracing::warn!("modem blocked, notifying clients");
        self.broadcast(MODEM_BLOCKED.as_bytes());
        ctx.set_aux_service(false);

        if !ctx.reset_enabled() {
            tracing::info!("reset disabled, modem left blocked");
            return false;
        }
        if dump {
            return true;
        }
        ctx.request(ControlRequest::ModemReset);
        false
    }

    /// React to one message read from a client.
    pub fn on_client_message(&self, reader: &mut ReaderState, raw: &[u8]) {
        let msg = message_text(raw);
        tracing::debug!(msg = %msg, "client message");

        if msg.contains(DUMP_BEGIN) {
            reader.dump = Some(DumpPhase::Begin);
        } else if msg.contains(DUMP_ONGOING) {
            reader.dump = Some(DumpPhase::Ongoing);
        } else if msg.contains(DUMP_COMPLETE) {
            reader.dump = Some(DumpPhase::Complete);
        }

        if msg.contains(MODEM_BLOCKED) {
            reader.later_reset = self.dispatch_blocked();
        } else if msg.contains(AGDSP_ASSERT) {
            self.broadcast(raw);
        } else if reader.dump == Some(DumpPhase::Complete) {
            tracing::info!("dump complete");
            reader.dump = None;
            self.ctx.dump.signal();
            if reader.later_reset {
                reader.later_reset = false;
                tracing::info!("blocked modem dumped, resetting");
                self.ctx.request(ControlRequest::ModemReset);
            }
        }
    }

    fn snapshot(&self) -> Vec<(usize, u64, Arc<UnixStream>)> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .clients
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c.id, Arc::clone(&c.stream))))
            .collect()
    }

    fn drop_if_current(&self, index: usize, id: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.clients[index].as_ref().is_some_and(|c| c.id == id) {
            slots.evict(index, "hung up");
        }
    }

    fn read_loop(&self) {
        let mut reader = ReaderState::default();
        let mut buf = [0u8; CLIENT_READ_BUF];
        loop {
            let clients = self.snapshot();
            let mut fds: Vec<RawFd> = Vec::with_capacity(clients.len() + 1);
            fds.push(self.wake_rx.as_raw_fd());
            fds.extend(clients.iter().map(|(_, _, s)| s.as_raw_fd()));

            let ready = match poll::wait_readable(&fds, None) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "client poll");
                    thread::sleep(self.ctx.timings().read_error_backoff);
                    continue;
                }
            };

            if ready[0] {
                let mut sink = [0u8; 32];
                while matches!((&self.wake_rx).read(&mut sink), Ok(n) if n > 0) {}
            }

            for ((index, id, stream), _) in clients
                .iter()
                .zip(ready.iter().skip(1))
                .filter(|(_, r)| **r)
            {
                match (&**stream).read(&mut buf) {
                    Ok(0) => self.drop_if_current(*index, *id),
                    Ok(n) => self.on_client_message(&mut reader, &buf[..n]),
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                    Err(e) => {
                        tracing::warn!(client = id, error = %e, "client read");
                        self.drop_if_current(*index, *id);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ClientBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBus")
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}
