// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Runtime and RPC settings.
//!
//! Every knob has a compiled-in default and can be overridden from the
//! environment before the owning component is constructed:
//!
//! | Env var                          | Default  | Used by                  |
//! |----------------------------------|----------|--------------------------|
//! | `GOSSAMER_SCHEDULER_THREADS`     | `4`      | [`crate::Runtime`]       |
//! | `GOSSAMER_SCHEDULER_NAME`        | `main`   | worker thread names      |
//! | `GOSSAMER_TCP_RECV_TIMEOUT`      | `120000` | [`crate::net::TcpServer`]|
//! | `GOSSAMER_RPC_HEARTBEAT_TIMEOUT` | `40000`  | server/registry liveness |
//! | `GOSSAMER_RPC_CALL_TIMEOUT`      | `30000`  | client call deadline     |
//!
//! Overrides are logged once at load so a misbehaving deployment can be
//! diagnosed from the log alone.

use std::time::Duration;

/// Milliseconds value meaning "no deadline".
pub const NO_TIMEOUT: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Number of worker OS threads.
    pub threads: usize,
    /// Base name for worker threads (`{name}_{index}`).
    pub name: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            threads: 4,
            name: "main".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSettings {
    /// Per-connection receive timeout applied to accepted sockets, in ms.
    pub recv_timeout_ms: u64,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcSettings {
    /// A connection with no inbound frame for this long is closed, in ms.
    pub heartbeat_timeout_ms: u64,
    /// Default per-call deadline for clients, in ms.
    pub call_timeout_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 40_000,
            call_timeout_ms: 30_000,
        }
    }
}

/// All settings a [`crate::Runtime`] and the RPC layer consume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub scheduler: SchedulerSettings,
    pub tcp: TcpSettings,
    pub rpc: RpcSettings,
}

impl Settings {
    /// Defaults overridden by whatever env vars are set. Malformed values are
    /// logged and ignored rather than failing startup.
    pub fn from_env() -> Self {
        let mut it = Self::default();
        if let Some(threads) = read_env_parsed("GOSSAMER_SCHEDULER_THREADS") {
            it.scheduler.threads = threads;
        }
        if let Ok(name) = std::env::var("GOSSAMER_SCHEDULER_NAME") {
            if !name.is_empty() {
                tracing::info!(name = %name, "scheduler name override");
                it.scheduler.name = name;
            }
        }
        if let Some(ms) = read_env_parsed("GOSSAMER_TCP_RECV_TIMEOUT") {
            it.tcp.recv_timeout_ms = ms;
        }
        if let Some(ms) = read_env_parsed("GOSSAMER_RPC_HEARTBEAT_TIMEOUT") {
            it.rpc.heartbeat_timeout_ms = ms;
        }
        if let Some(ms) = read_env_parsed("GOSSAMER_RPC_CALL_TIMEOUT") {
            it.rpc.call_timeout_ms = ms;
        }
        it
    }
}

/// Convert a ms knob into an `Option<Duration>`, mapping [`NO_TIMEOUT`] to
/// `None`.
#[must_use]
pub fn ms_to_deadline(ms: u64) -> Option<Duration> {
    (ms != NO_TIMEOUT).then(|| Duration::from_millis(ms))
}

fn read_env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => {
            tracing::info!(key, value = %raw, "settings override from env");
            Some(v)
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparsable settings override ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.scheduler.threads, 4);
        assert_eq!(s.scheduler.name, "main");
        assert_eq!(s.tcp.recv_timeout_ms, 120_000);
        assert_eq!(s.rpc.heartbeat_timeout_ms, 40_000);
    }

    #[test]
    fn env_override_applies() {
        // Serialize access: env vars are process-global.
        unsafe { std::env::set_var("GOSSAMER_SCHEDULER_THREADS", "9") };
        let s = Settings::from_env();
        assert_eq!(s.scheduler.threads, 9);
        unsafe { std::env::remove_var("GOSSAMER_SCHEDULER_THREADS") };
    }

    #[test]
    fn garbage_override_is_ignored() {
        unsafe { std::env::set_var("GOSSAMER_TCP_RECV_TIMEOUT", "soon") };
        let s = Settings::from_env();
        assert_eq!(s.tcp.recv_timeout_ms, 120_000);
        unsafe { std::env::remove_var("GOSSAMER_TCP_RECV_TIMEOUT") };
    }

    #[test]
    fn no_timeout_maps_to_none() {
        assert_eq!(ms_to_deadline(NO_TIMEOUT), None);
        assert_eq!(ms_to_deadline(250), Some(Duration::from_millis(250)));
    }
}
