//! # Modem state machine
//!
//! One authoritative [`ModemState`] for the whole daemon, stored in an
//! atomic so monitors, the client bus and the control loop can all read it
//! without taking the client writer lock. Reads are advisory: a value that
//! is one event stale is acceptable everywhere it is consulted.
//!
//! The alive timer is a single-shot, cancellable timer thread. Arming it
//! again replaces the previous deadline; stopping it is idempotent.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModemState {
    Init = 0,
    Loading = 1,
    Booting = 2,
    Alive = 3,
    Assert = 4,
    Block = 5,
    Reset = 6,
    RebootExternalModem = 7,
    RebootSystem = 8,
}

impl ModemState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ModemState::Loading,
            2 => ModemState::Booting,
            3 => ModemState::Alive,
            4 => ModemState::Assert,
            5 => ModemState::Block,
            6 => ModemState::Reset,
            7 => ModemState::RebootExternalModem,
            8 => ModemState::RebootSystem,
            _ => ModemState::Init,
        }
    }

    /// Line sent to a client right after it connects.
    pub fn status_line(self) -> &'static str {
        match self {
            ModemState::Init | ModemState::Loading | ModemState::Booting => "Modem State: Offline",
            ModemState::Alive => "Modem State: Alive",
            ModemState::Assert => "Modem State: Assert",
            ModemState::Reset => "Modem State: Reset",
            ModemState::Block | ModemState::RebootExternalModem | ModemState::RebootSystem => {
                "Modem State: Unknown"
            }
        }
    }

    /// States in which a reset request from the control channel is honoured.
    pub fn accepts_reset(self) -> bool {
        matches!(
            self,
            ModemState::Block | ModemState::Assert | ModemState::Reset
        )
    }
}

impl fmt::Display for ModemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── StateMachine ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StateMachine {
    state: AtomicU8,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ModemState::Init as u8),
        }
    }

    pub fn get(&self) -> ModemState {
        ModemState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Store `next` and return the state it replaced.
    pub fn set(&self, next: ModemState) -> ModemState {
        let prev = ModemState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            tracing::info!(from = %prev, to = %next, "modem state");
        }
        prev
    }

    /// Move to `next` only if the current state is `expected`.
    pub fn transition(&self, expected: ModemState, next: ModemState) -> bool {
        let ok = self
            .state
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if ok && expected != next {
            tracing::info!(from = %expected, to = %next, "modem state");
        }
        ok
    }
}

// ─── AliveTimer ─────────────────────────────────────────────────────────────

struct Armed {
    generation: u64,
    // Dropping the sender wakes the timer thread without firing.
    _cancel: Sender<()>,
}

/// Single-shot timer that fires unless the modem reports alive in time.
pub struct AliveTimer {
    armed: Arc<Mutex<Option<Armed>>>,
    generation: AtomicU64,
}

impl Default for AliveTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl AliveTimer {
    pub fn new() -> Self {
        Self {
            armed: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm (or re-arm) the timer. `on_expire` runs on the timer thread if
    /// the deadline passes without a [`stop`](Self::stop).
    pub fn start<F>(&self, timeout: Duration, on_expire: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = bounded::<()>(1);

        // Replacing the slot drops any previous sender, cancelling it.
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = Some(Armed {
            generation,
            _cancel: cancel_tx,
        });

        let armed = Arc::clone(&self.armed);
        let spawned = thread::Builder::new()
            .name("alive-timer".into())
            .spawn(move || {
                match cancel_rx.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
                let fire = {
                    let mut slot = armed.lock().unwrap_or_else(|e| e.into_inner());
                    match slot.as_ref() {
                        Some(a) if a.generation == generation => {
                            slot.take();
                            true
                        }
                        _ => false,
                    }
                };
                if fire {
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "alive timer expired");
                    on_expire();
                }
            });

        if let Err(e) = spawned {
            self.armed.lock().unwrap_or_else(|e| e.into_inner()).take();
            tracing::error!(error = %e, "failed to spawn alive timer");
            return Err(e);
        }
        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "alive timer armed");
        Ok(())
    }

    /// Disarm. Safe to call from any thread, any number of times.
    pub fn stop(&self) {
        if self
            .armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            tracing::debug!("alive timer stopped");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl fmt::Debug for AliveTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AliveTimer")
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // ─── StateMachine ───────────────────────────────────────────────────────

    #[test]
    fn starts_in_init() {
        assert_eq!(StateMachine::new().get(), ModemState::Init);
    }

    #[test]
    fn set_returns_previous() {
        let sm = StateMachine::new();
        assert_eq!(sm.set(ModemState::Loading), ModemState::Init);
        assert_eq!(sm.set(ModemState::Booting), ModemState::Loading);
        assert_eq!(sm.get(), ModemState::Booting);
    }

    #[test]
    fn transition_is_conditional() {
        let sm = StateMachine::new();
        sm.set(ModemState::Alive);
        assert!(!sm.transition(ModemState::Booting, ModemState::Assert));
        assert_eq!(sm.get(), ModemState::Alive);
        assert!(sm.transition(ModemState::Alive, ModemState::Assert));
        assert_eq!(sm.get(), ModemState::Assert);
    }

    #[test]
    fn status_lines() {
        assert_eq!(ModemState::Booting.status_line(), "Modem State: Offline");
        assert_eq!(ModemState::Alive.status_line(), "Modem State: Alive");
        assert_eq!(ModemState::Block.status_line(), "Modem State: Unknown");
    }

    // ─── AliveTimer ─────────────────────────────────────────────────────────

    #[test]
    fn stop_twice_is_noop() {
        let timer = AliveTimer::new();
        timer.stop();
        timer.stop();
        assert!(!timer.is_armed());

        timer.start(Duration::from_secs(60), || {}).unwrap();
        assert!(timer.is_armed());
        timer.stop();
        timer.stop();
        assert!(!timer.is_armed());
    }

    #[test]
    fn fires_after_timeout() {
        let timer = AliveTimer::new();
        let (tx, rx) = bounded(1);
        timer
            .start(Duration::from_millis(10), move || {
                let _ = tx.send(());
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(2))
            .expect("timer should fire");
        assert!(!timer.is_armed(), "fired timer must disarm itself");
    }

    #[test]
    fn stop_prevents_firing() {
        let timer = AliveTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        timer
            .start(Duration::from_millis(30), move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        timer.stop();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearm_replaces_previous_deadline() {
        let timer = AliveTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&fired);
        timer
            .start(Duration::from_millis(20), move || {
                first.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let second = Arc::clone(&fired);
        timer
            .start(Duration::from_millis(40), move || {
                second.fetch_add(10, Ordering::SeqCst);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 10, "only the second arm fires");
    }
}
