use camino::Utf8PathBuf;
use std::env;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

use crate::codec::CodecKind;
use crate::logging::LogFormat;
use crate::socket::SocketEndpoint;

/// Default TCP port used when Unix domain sockets are not available.
pub const DEFAULT_TCP_PORT: u16 = 20003;

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default deadline, in milliseconds, applied by `Client::call_default`.
/// Zero means calls wait without a deadline.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 0;

/// Default log filter expression.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Default wire codec.
#[must_use]
pub fn default_codec() -> CodecKind {
    CodecKind::Binary
}

/// Default call deadline in milliseconds.
#[must_use]
pub fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

/// Computes the default endpoint for listeners and clients.
#[must_use]
pub fn default_socket_endpoint() -> SocketEndpoint {
    default_socket_endpoint_inner()
}

#[cfg(unix)]
fn default_socket_endpoint_inner() -> SocketEndpoint {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("wirecall");
    if apply_namespace {
        base.push(user_namespace());
    }

    SocketEndpoint::unix(base.join("wirecall.sock"))
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

#[cfg(unix)]
fn fallback_base_directory() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    // SAFETY: `geteuid` has no preconditions and cannot fail.
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn default_socket_endpoint_inner() -> SocketEndpoint {
    SocketEndpoint::tcp("127.0.0.1", DEFAULT_TCP_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn default_endpoint_is_a_namespaced_unix_socket() {
        let endpoint = default_socket_endpoint();
        let path = endpoint.unix_path().expect("unix default");
        assert_eq!(path.file_name(), Some("wirecall.sock"));
        assert!(path.as_str().contains("wirecall"));
    }

    #[test]
    fn calls_have_no_deadline_by_default() {
        assert_eq!(default_call_timeout_ms(), 0);
    }
}
