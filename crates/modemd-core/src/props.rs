//! System property access.
//!
//! Device paths and policy toggles live in a string key/value store owned by
//! the platform. The daemon only reads them (and pokes `ctl.*` keys to start
//! and stop services), so the store sits behind a small trait.

use std::collections::HashMap;
use std::sync::RwLock;

// ─── Keys ───────────────────────────────────────────────────────────────────

pub const MODEM_TYPE: &str = "ro.vendor.radio.modemtype";
pub const ASSERT_DEV: &str = "ro.vendor.modem.assert";
pub const DIAG_DEV: &str = "ro.vendor.modem.diag";
pub const LOG_DEV: &str = "ro.vendor.modem.log";
pub const ALIVE_DEV: &str = "ro.vendor.modem.alive";
pub const TTY_DEV: &str = "ro.vendor.modem.tty";
pub const MODEM_DEV: &str = "ro.vendor.modem.dev";
pub const LOOP_DEV: &str = "ro.vendor.modem.loop";
pub const MODEM_RESET: &str = "persist.vendor.sys.modemreset";
pub const SYSDUMP: &str = "persist.vendor.sysdump";
pub const SAVE_DUMP: &str = "persist.vendor.sys.modem.save_dump";
pub const REBOOT_MODEM_ONLY: &str = "persist.vendor.sys.rebootmodemonly";
pub const WIFI_ONLY: &str = "persist.vendor.sys.wifionly";
pub const WIFI_ONLY_IMEI: &str = "vendor.sys.wifionly.imei";
pub const NV_PARTITION: &str = "persist.vendor.modem.nvp";
pub const PARTITION_PATH: &str = "ro.vendor.product.partitionpath";
pub const DEBUGGABLE: &str = "ro.debuggable";
pub const SP_WATCHDOG: &str = "persist.vendor.modem.spwdt";
pub const CTL_START: &str = "ctl.start";
pub const CTL_STOP: &str = "ctl.stop";

/// Service started once the modem is alive and stopped on assert/reset.
pub const AUX_SERVICE: &str = "vendor.cp_diskserver";

pub const DEFAULT_LOOP_DEV: &str = "/dev/spipe_lte0";

/// Key/value property store.
pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Integer value with C `atoi` semantics: leading digits only, 0 when
    /// nothing parses.
    fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(v) => atoi(&v),
            None => default,
        }
    }

    /// Policy toggle: any non-zero integer value enables it.
    fn get_flag(&self, key: &str) -> bool {
        self.get_int(key, 0) != 0
    }
}

/// Leading-integer parse. Whitespace and an optional sign are accepted,
/// trailing garbage is ignored.
pub fn atoi(s: &str) -> i64 {
    let s = s.trim_start();
    let (neg, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value.wrapping_mul(10).wrapping_add(i64::from(b - b'0'));
    }
    if neg { -value } else { value }
}

/// In-memory store, seeded from the daemon config.
#[derive(Debug, Default)]
pub struct MemoryProperties {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: RwLock::new(map),
        }
    }
}

impl PropertyStore for MemoryProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        tracing::debug!(key, value, "property set");
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atoi_matches_c_semantics() {
        assert_eq!(atoi("1"), 1);
        assert_eq!(atoi("  42abc"), 42);
        assert_eq!(atoi("-7"), -7);
        assert_eq!(atoi("on"), 0);
        assert_eq!(atoi(""), 0);
    }

    #[test]
    fn flag_defaults_off_when_absent() {
        let props = MemoryProperties::new();
        assert!(!props.get_flag(MODEM_RESET));
        props.set(MODEM_RESET, "1");
        assert!(props.get_flag(MODEM_RESET));
    }

    #[test]
    fn get_or_falls_back() {
        let props = MemoryProperties::with_values([(LOOP_DEV, "/dev/x")]);
        assert_eq!(props.get_or(LOOP_DEV, DEFAULT_LOOP_DEV), "/dev/x");
        assert_eq!(props.get_or(DIAG_DEV, "none"), "none");
    }
}
