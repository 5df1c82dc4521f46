//! TCP echo server.
//!
//! Accepts connections, echoes received bytes back verbatim and in
//! order, and closes connections that stay idle past the configured
//! timeout. Per-connection failures never take down the listener.

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 10000;

/// Bytes read per recv call
const READ_CHUNK: usize = 4096;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Bound, listening server socket.
///
/// Created once at startup and owned by the accept loop for the
/// lifetime of the process.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind all interfaces on `port` with address reuse enabled and a
    /// backlog of 1024.
    ///
    /// Any failure drops the partially built socket, so no listener
    /// state survives a failed bind.
    pub fn bind(port: u16) -> Result<Self, BindError> {
        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(BindError::Socket)?;
        socket.set_reuse_address(true).map_err(BindError::Socket)?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&addr.into())
            .map_err(|e| BindError::Bind(port, e))?;
        socket
            .listen(BACKLOG)
            .map_err(|e| BindError::Listen(port, e))?;

        // Tokio requires the socket in nonblocking mode.
        socket.set_nonblocking(true).map_err(BindError::Socket)?;
        let inner = TcpListener::from_std(socket.into()).map_err(BindError::Socket)?;

        Ok(Listener { inner })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Errors constructing a [`Listener`]. These are fatal at startup.
#[derive(Debug)]
pub enum BindError {
    /// Creating or configuring the socket failed.
    Socket(io::Error),
    /// The bind itself failed, typically because the port is in use.
    Bind(u16, io::Error),
    /// The socket could not enter the listening state.
    Listen(u16, io::Error),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::Socket(e) => write!(f, "failed to create listener socket: {e}"),
            BindError::Bind(port, e) => write!(f, "failed to bind port {port}: {e}"),
            BindError::Listen(port, e) => write!(f, "failed to listen on port {port}: {e}"),
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BindError::Socket(e) | BindError::Bind(_, e) | BindError::Listen(_, e) => Some(e),
        }
    }
}

/// Accept connections forever, serving each on its own task.
///
/// Accept failures are transient: they are logged and the loop
/// continues. A slow or broken client only ever affects its own task;
/// the listener socket itself stays open for the life of the process.
pub async fn serve(listener: Listener, idle_timeout: Duration) {
    let connection_limit = Arc::new(Semaphore::new(MAX_CONNECTIONS));

    loop {
        // Wait for a connection slot. The semaphore is owned by this
        // loop and never closed.
        let permit = Arc::clone(&connection_limit)
            .acquire_owned()
            .await
            .expect("connection semaphore is never closed");

        match listener.inner.accept().await {
            Ok((stream, peer)) => {
                let conn = Connection::new(stream, peer, idle_timeout);

                tokio::spawn(async move {
                    conn.serve().await;
                    drop(permit);
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// How a connection's echo loop ended.
///
/// None of these are fatal to the listener; the terminal state is
/// always a closed socket.
#[derive(Debug)]
pub enum EchoOutcome {
    /// The peer closed its write side; every byte received was echoed.
    PeerClosed,
    /// No data arrived within the idle window.
    TimedOut,
    /// A read or write failed mid-stream.
    Errored(io::Error),
}

/// A single accepted client connection.
///
/// Owned exclusively by its serving task; dropping it closes the
/// socket, so every exit path releases the connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    idle_timeout: Duration,
}

impl Connection {
    /// Wrap an accepted stream with its idle-read timeout.
    pub fn new(stream: TcpStream, peer: SocketAddr, idle_timeout: Duration) -> Self {
        Connection {
            stream,
            peer,
            idle_timeout,
        }
    }

    /// Run the echo loop to completion and log how it ended.
    pub async fn serve(mut self) -> EchoOutcome {
        debug!(peer = %self.peer, "Client connected");

        let outcome = self.echo().await;
        match &outcome {
            EchoOutcome::PeerClosed => {
                debug!(peer = %self.peer, "Client closed connection");
            }
            EchoOutcome::TimedOut => {
                info!(peer = %self.peer, timeout = ?self.idle_timeout, "Client idle timeout");
            }
            EchoOutcome::Errored(e) => {
                warn!(peer = %self.peer, error = %e, "Connection error");
            }
        }

        outcome
    }

    /// Echo until the peer closes, the idle timeout fires, or I/O
    /// fails. Each read is written back in full before the next read,
    /// so bytes go out in exactly the order they arrived.
    async fn echo(&mut self) -> EchoOutcome {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK);

        loop {
            buffer.clear();

            match timeout(self.idle_timeout, self.stream.read_buf(&mut buffer)).await {
                Err(_elapsed) => return EchoOutcome::TimedOut,
                Ok(Ok(0)) => return EchoOutcome::PeerClosed,
                Ok(Ok(n)) => {
                    // write_all retries short writes until every byte
                    // read is back on the wire.
                    if let Err(e) = self.stream.write_all(&buffer[..n]).await {
                        return EchoOutcome::Errored(e);
                    }
                }
                Ok(Err(e)) => return EchoOutcome::Errored(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::sleep;

    /// Bind an ephemeral port, spawn the accept loop, and return the
    /// address clients should connect to.
    async fn start_server(idle_timeout: Duration) -> SocketAddr {
        let listener = Listener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, idle_timeout));
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let addr = start_server(Duration::from_secs(5)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"ping").await.unwrap();

        let mut reply = [0u8; 4];
        timeout(Duration::from_secs(1), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn test_echo_preserves_order_across_writes() {
        let addr = start_server(Duration::from_secs(5)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        for part in [&b"hello"[..], b" ", b"world"] {
            client.write_all(part).await.unwrap();
        }

        let mut reply = [0u8; 11];
        timeout(Duration::from_secs(1), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"hello world");
    }

    #[tokio::test]
    async fn test_echo_payload_larger_than_read_chunk() {
        let addr = start_server(Duration::from_secs(5)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

        // Drain the echoed bytes while writing so neither side stalls
        // on full socket buffers.
        let (mut rd, mut wr) = client.split();
        let write = async {
            wr.write_all(&payload).await.unwrap();
        };
        let mut reply = vec![0u8; payload.len()];
        let read = async {
            rd.read_exact(&mut reply).await.unwrap();
        };
        timeout(Duration::from_secs(5), async { tokio::join!(write, read) })
            .await
            .unwrap();

        assert_eq!(reply, payload);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let addr = start_server(Duration::from_millis(200)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Send nothing; the server should close once the window elapses.
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_echo_then_idle_timeout() {
        let addr = start_server(Duration::from_millis(200)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        timeout(Duration::from_secs(1), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"ping");

        // Going quiet after traffic still trips the idle timeout.
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_half_close_flushes_all_bytes() {
        let addr = start_server(Duration::from_secs(5)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let payload: Vec<u8> = (0..8 * 1024).map(|i| (i % 97) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, payload);
    }

    #[tokio::test]
    async fn test_listener_survives_closed_connections() {
        let addr = start_server(Duration::from_millis(200)).await;

        // First client: normal close.
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"one").await.unwrap();
        let mut reply = [0u8; 3];
        first.read_exact(&mut reply).await.unwrap();
        drop(first);

        // Second client: let the idle timeout end it.
        let second = TcpStream::connect(addr).await.unwrap();
        sleep(Duration::from_millis(400)).await;
        drop(second);

        // The listener must still accept and echo.
        let mut third = TcpStream::connect(addr).await.unwrap();
        third.write_all(b"three").await.unwrap();
        let mut reply = [0u8; 5];
        timeout(Duration::from_secs(1), third.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"three");
    }

    #[tokio::test]
    async fn test_bind_port_in_use_fails() {
        let first = Listener::bind(0).unwrap();
        let port = first.local_addr().unwrap().port();

        match Listener::bind(port) {
            Err(BindError::Bind(p, _)) => assert_eq!(p, port),
            other => panic!("expected bind error, got {:?}", other.map(|_| "listener")),
        }
    }
}
