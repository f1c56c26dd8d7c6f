//! TCP sockets set up for interactive traffic (low delay TOS, no Nagle).
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::Duration,
};

const TOS_LOWDELAY: u32 = 0x10;

/// Non-blocking listener on all interfaces.  Port 0 picks a free port.
pub fn new_listener(port: u16) -> io::Result<TcpListener> {
    let raw_sock = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    raw_sock.set_reuse_address(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    raw_sock.bind(&SockAddr::from(addr))?;
    raw_sock.listen(128)?;
    raw_sock.set_nonblocking(true)?;
    Ok(TcpListener::from(raw_sock))
}

/// Tune an accepted or connected stream and make it non-blocking.
pub fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    // TOS is advisory, some platforms refuse it
    let _ = sock.set_tos(TOS_LOWDELAY);
    sock.set_nodelay(true)?;
    stream.set_nonblocking(true)
}

/// Connect to "host:port" (port defaults to 2049) with a timeout per resolved address.
pub fn connect(host: &str, timeout: Duration) -> io::Result<TcpStream> {
    let target = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:2049", host)
    };
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "host did not resolve");
    for addr in target.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                prepare_stream(&stream)?;
                return Ok(stream);
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}
