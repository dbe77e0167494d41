//! Listening socket and accepted-connection setup for the queen

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

/// Bind a non-blocking listener with room for `backlog` pending connections
pub fn listen(addr: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    // 避免监听端口停留在TIME_WAIT
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Accept one pending connection, if any.
///
/// The returned stream is blocking with small-message delays disabled, ready
/// for exact-byte transfers.
pub fn accept(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                // SAFETY: the descriptor comes straight out of the mio stream,
                // which gives up ownership through into_raw_fd.
                let stream = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
                tune(&stream)?;
                return Ok(Some((stream, peer)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Disable Nagle and corking so the small protocol fields leave immediately
fn tune(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    socket2::SockRef::from(stream).set_cork(false)?;
    Ok(())
}
