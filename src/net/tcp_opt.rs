use std::io;
use std::net::{SocketAddr, TcpListener};

use socket2::{Domain, Protocol, Socket, Type};

/// Smallest backlog the listener is created with.
pub const MIN_BACKLOG: i32 = 5;

/// Creates the listening socket for the server loop.
///
/// # Options
/// * `SO_REUSEADDR`: a restarted server can rebind while old connections sit in TIME_WAIT.
/// * `Non-blocking`: required by the `mio` event loop.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.max(MIN_BACKLOG))?;
    Ok(socket.into())
}

/// Per-connection options applied right after `accept`.
///
/// Tracking samples are tiny and latency matters more than throughput, so
/// Nagle's algorithm is disabled.
pub fn apply_optimizations(stream: &mio::net::TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
