//! Layered configuration shared by wirecall listeners and clients.
//!
//! Values resolve in the usual `ortho_config` order: built-in defaults, then
//! a discovered or `--config-path` TOML file, then `WIRECALL_*` environment
//! variables, then command-line flags.

mod codec;
mod defaults;
mod logging;
mod socket;

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use codec::{CodecKind, CodecKindParseError};
pub use defaults::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_LOG_FILTER, DEFAULT_TCP_PORT, default_call_timeout_ms,
    default_codec, default_log_filter, default_log_filter_string, default_log_format,
    default_socket_endpoint,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use socket::{SocketEndpoint, SocketParseError, SocketPreparationError};

/// Resolved runtime configuration.
#[derive(Debug, Clone, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "WIRECALL")]
pub struct Config {
    /// Endpoint the listener binds and the client dials.
    #[serde(default = "default_socket_endpoint")]
    pub endpoint: SocketEndpoint,
    /// `tracing` filter directive applied by telemetry initialisation.
    #[serde(default = "default_log_filter_string")]
    pub log_filter: String,
    /// Output format for log records.
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Wire codec spoken on accepted and dialled connections.
    #[serde(default = "default_codec")]
    pub codec: CodecKind,
    /// Deadline applied by `Client::call_default`, in milliseconds; `0`
    /// disables the deadline.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Config {
    /// Endpoint the listener binds and the client dials.
    #[must_use]
    pub const fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Log filter directive.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Configured wire codec.
    #[must_use]
    pub const fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Default call deadline, or `None` when calls may wait indefinitely.
    #[must_use]
    pub const fn call_timeout(&self) -> Option<Duration> {
        if self.call_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.call_timeout_ms))
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_socket_endpoint(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            codec: default_codec(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}
