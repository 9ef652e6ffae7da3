//! Whole-system actions the daemon can take as a last resort.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Platform hooks that end the current boot.
pub trait SystemControl: Send + Sync {
    /// Crash the kernel so the platform reboots and captures a dump.
    ///
    /// Real implementations never return; test doubles record the call and
    /// return so the caller's thread can be observed.
    fn reboot_system(&self, reason: &str);
}

/// Reboots through the magic sysrq trigger.
#[derive(Debug, Clone)]
pub struct SysrqReboot {
    trigger: PathBuf,
}

impl SysrqReboot {
    pub fn new(trigger: impl Into<PathBuf>) -> Self {
        Self {
            trigger: trigger.into(),
        }
    }
}

impl SystemControl for SysrqReboot {
    fn reboot_system(&self, reason: &str) {
        tracing::error!(reason, trigger = %self.trigger.display(), "rebooting system");
        let res = OpenOptions::new()
            .write(true)
            .open(&self.trigger)
            .and_then(|mut f| f.write_all(b"c"));
        if let Err(e) = res {
            tracing::error!(error = %e, "sysrq trigger");
        }
        // The kernel is going down; nothing useful is left to do here.
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }
}
