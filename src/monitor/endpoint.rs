//! Monitor socket addressing
//!
//! QEMU can expose its monitors on a Unix socket or a TCP port. An
//! [`Endpoint`] renders the `-monitor`/`-qmp` argument for launch and opens
//! a [`ControlStream`] for the clients.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

use crate::error::{Error, Result};

/// Where a monitor socket listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    Unix { path: PathBuf },
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Argument value for `-monitor` / `-qmp`, with QEMU listening as server
    pub fn qemu_arg(&self) -> String {
        match self {
            Endpoint::Unix { path } => format!("unix:{},server,nowait", path.display()),
            Endpoint::Tcp { host, port } => format!("tcp:{}:{},server,nowait", host, port),
        }
    }

    /// Parse a QEMU chardev spec such as `tcp:localhost:4444,server,nowait`
    /// or `unix:/run/vm/monitor.sock,server,nowait`
    pub fn parse(spec: &str) -> Result<Self> {
        let address = spec.split(',').next().unwrap_or_default();

        if let Some(path) = address.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::InvalidInput(format!("empty unix socket path in {spec:?}")));
            }
            return Ok(Endpoint::unix(path));
        }

        if let Some(rest) = address.strip_prefix("tcp:") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| Error::InvalidInput(format!("missing port in {spec:?}")))?;
            let port: u16 = port
                .parse()
                .map_err(|_| Error::InvalidInput(format!("invalid port in {spec:?}")))?;
            let host = if host.is_empty() { "localhost" } else { host };
            return Ok(Endpoint::tcp(host, port));
        }

        Err(Error::InvalidInput(format!(
            "unsupported monitor address {spec:?}"
        )))
    }

    /// Open a stream to the monitor
    pub async fn connect(&self) -> Result<ControlStream> {
        let result = match self {
            Endpoint::Unix { path } => UnixStream::connect(path).await.map(ControlStream::Unix),
            Endpoint::Tcp { host, port } => TcpStream::connect((host.as_str(), *port))
                .await
                .map(ControlStream::Tcp),
        };

        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found("monitor socket", self.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}: {}", self, e))
            }
            _ => Error::Unavailable(format!("cannot connect to {}: {}", self, e)),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

/// Connected monitor socket, either flavor
pub enum ControlStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// Delegate AsyncRead to the inner stream
impl AsyncRead for ControlStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            ControlStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

/// Delegate AsyncWrite to the inner stream
impl AsyncWrite for ControlStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ControlStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            ControlStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Unix(s) => Pin::new(s).poll_flush(cx),
            ControlStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            ControlStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qemu_arg() {
        let ep = Endpoint::unix("/srv/vms/alpha/monitor.sock");
        assert_eq!(ep.qemu_arg(), "unix:/srv/vms/alpha/monitor.sock,server,nowait");
        assert_eq!(
            Endpoint::tcp("127.0.0.1", 4444).qemu_arg(),
            "tcp:127.0.0.1:4444,server,nowait"
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            Endpoint::parse("tcp:localhost:4444,server,nowait").unwrap(),
            Endpoint::tcp("localhost", 4444)
        );
        assert_eq!(Endpoint::parse("tcp::5555").unwrap(), Endpoint::tcp("localhost", 5555));
        assert_eq!(
            Endpoint::parse("unix:/tmp/qmp.sock,server").unwrap(),
            Endpoint::unix("/tmp/qmp.sock")
        );
        assert!(Endpoint::parse("stdio").is_err());
        assert!(Endpoint::parse("tcp:localhost:notaport").is_err());
    }

    #[tokio::test]
    async fn test_connect_missing_socket_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Endpoint::unix(dir.path().join("absent.sock"))
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
