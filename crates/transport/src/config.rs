//! Transport settings and the flat `key=value` configuration parser.

use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WRITE_QUEUE_MAX_BYTES: usize = 2 * 1024 * 1024;

/// Overrides the default request timeout at construction when set to a
/// parseable unsigned integer.
pub const ENV_REQUEST_TIMEOUT_MS: &str = "MCP_STDIOTRANSPORT_TIMEOUT_MS";

/// Tunables, all configured before `start`. A value of 0 disables the
/// corresponding timeout; the write-queue cap is clamped to at least 1 byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub request_timeout_ms: u64,
    pub idle_read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub write_queue_max_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            idle_read_timeout_ms: 0,
            write_timeout_ms: 0,
            write_queue_max_bytes: DEFAULT_WRITE_QUEUE_MAX_BYTES,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(raw) = std::env::var(ENV_REQUEST_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => settings.request_timeout_ms = ms,
                Err(_) => {
                    log::warn!("invalid {ENV_REQUEST_TIMEOUT_MS} value {raw:?}, keeping default");
                }
            }
        }
        settings
    }

    /// Apply `key=value` pairs separated by `;` or whitespace. Unknown keys
    /// and unparseable values are logged and skipped.
    pub fn apply_str(&mut self, text: &str) {
        let pairs = text
            .split(|c: char| c == ';' || c.is_whitespace())
            .filter(|p| !p.is_empty());
        for pair in pairs {
            let Some((key, value)) = pair.split_once('=') else {
                log::warn!("ignoring malformed config pair {pair:?}");
                continue;
            };
            self.apply_pair(key.trim(), value.trim());
        }
    }

    fn apply_pair(&mut self, key: &str, value: &str) {
        match key {
            "timeout_ms" => Self::parse_into(&mut self.request_timeout_ms, key, value),
            "idle_read_timeout_ms" => Self::parse_into(&mut self.idle_read_timeout_ms, key, value),
            "write_timeout_ms" => Self::parse_into(&mut self.write_timeout_ms, key, value),
            "write_queue_max_bytes" => match value.parse::<usize>() {
                Ok(bytes) => self.write_queue_max_bytes = bytes.max(1),
                Err(_) => log::warn!("ignoring unparseable value for {key}: {value:?}"),
            },
            _ => log::warn!("ignoring unknown config key {key:?}"),
        }
    }

    fn parse_into(slot: &mut u64, key: &str, value: &str) {
        match value.parse::<u64>() {
            Ok(ms) => *slot = ms,
            Err(_) => log::warn!("ignoring unparseable value for {key}: {value:?}"),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn idle_read_timeout(&self) -> Option<Duration> {
        (self.idle_read_timeout_ms > 0).then(|| Duration::from_millis(self.idle_read_timeout_ms))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.request_timeout_ms, 30_000);
        assert_eq!(s.idle_read_timeout_ms, 0);
        assert_eq!(s.write_timeout_ms, 0);
        assert_eq!(s.write_queue_max_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn parses_semicolon_separated_pairs() {
        let mut s = Settings::default();
        s.apply_str("timeout_ms=500;write_timeout_ms=200");
        assert_eq!(s.request_timeout_ms, 500);
        assert_eq!(s.write_timeout_ms, 200);
    }

    #[test]
    fn parses_whitespace_separated_pairs() {
        let mut s = Settings::default();
        s.apply_str("idle_read_timeout_ms=100 \t write_queue_max_bytes=4096");
        assert_eq!(s.idle_read_timeout_ms, 100);
        assert_eq!(s.write_queue_max_bytes, 4096);
    }

    #[test]
    fn clamps_queue_cap_to_one() {
        let mut s = Settings::default();
        s.apply_str("write_queue_max_bytes=0");
        assert_eq!(s.write_queue_max_bytes, 1);
    }

    #[test]
    fn skips_unknown_keys_and_bad_values() {
        let mut s = Settings::default();
        s.apply_str("bogus=1;timeout_ms=abc;timeout_ms=750;dangling");
        assert_eq!(s.request_timeout_ms, 750);
    }

    #[test]
    fn zero_disables_timeouts() {
        let mut s = Settings::default();
        s.apply_str("timeout_ms=0");
        assert_eq!(s.request_timeout(), None);
        assert_eq!(s.idle_read_timeout(), None);
        assert_eq!(s.write_timeout(), None);
    }

    #[test]
    fn env_override_applies_at_construction() {
        std::env::set_var(ENV_REQUEST_TIMEOUT_MS, "1234");
        let s = Settings::from_env();
        std::env::remove_var(ENV_REQUEST_TIMEOUT_MS);
        assert_eq!(s.request_timeout_ms, 1234);
    }
}
