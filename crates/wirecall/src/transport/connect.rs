//! Client-side connection establishment.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use wirecall_config::SocketEndpoint;

#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

#[cfg(unix)]
use socket2::{Domain, SockAddr, Socket, Type};

use super::ConnectionStream;
use crate::errors::ConnectError;

/// Upper bound on a single connection attempt.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a stream to `endpoint`.
///
/// # Errors
///
/// Returns [`ConnectError::Resolve`] when a TCP host does not resolve and
/// [`ConnectError::Connect`] when the connection attempt fails or times out.
pub fn connect(endpoint: &SocketEndpoint) -> Result<ConnectionStream, ConnectError> {
    match endpoint {
        SocketEndpoint::Tcp { host, port } => {
            let address = resolve_tcp_address(host, *port).map_err(|source| {
                ConnectError::Resolve {
                    endpoint: endpoint.to_string(),
                    source,
                }
            })?;

            let stream = TcpStream::connect_timeout(&address, CONNECTION_TIMEOUT).map_err(
                |source| ConnectError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                },
            )?;
            stream
                .set_nodelay(true)
                .map_err(|source| ConnectError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            Ok(ConnectionStream::Tcp(stream))
        }
        SocketEndpoint::Unix { path } => {
            #[cfg(unix)]
            {
                connect_unix(path.as_str()).map_err(|source| ConnectError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }

            #[cfg(not(unix))]
            {
                let _ = path;
                Err(ConnectError::UnsupportedUnix {
                    endpoint: endpoint.to_string(),
                })
            }
        }
    }
}

fn resolve_tcp_address(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .find(|addr| matches!(addr, SocketAddr::V4(_) | SocketAddr::V6(_)))
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved addresses"))
}

#[cfg(unix)]
fn connect_unix(path: &str) -> io::Result<ConnectionStream> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let address = SockAddr::unix(path)?;
    socket.connect_timeout(&address, CONNECTION_TIMEOUT)?;
    let stream = UnixStream::from(OwnedFd::from(socket));
    Ok(ConnectionStream::Unix(stream))
}
