//! TCP transport plumbing.
//!
//! The framing engine only needs an ordered, reliable duplex byte stream;
//! this module supplies one over TCP and wraps it so every byte read or
//! written is counted against a worker's [`StreamCounter`].

use crate::error::StressError;
use crate::results::StreamCounter;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// Parse `ip:port`, `host:port`, or `*:port` / `+:port` (all interfaces)
pub fn parse_endpoint(value: &str) -> Result<SocketAddr, StressError> {
    let value = value.trim();
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| StressError::InvalidConfig(format!("invalid endpoint '{}'", value)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| StressError::InvalidConfig(format!("invalid port in endpoint '{}'", value)))?;

    match host {
        "*" | "+" => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
        _ => (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| StressError::InvalidConfig(format!("could not resolve '{}'", host))),
    }
}

/// Address a client should dial to reach a server bound to `bound`
pub fn dial_address(bound: SocketAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        let loopback = match bound.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(loopback, bound.port())
    } else {
        bound
    }
}

/// Bind a listening socket with address reuse enabled
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Connect to `addr` with low-latency socket options
pub async fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    configure(&stream)?;
    Ok(stream)
}

/// Disable Nagle so small frames are not held back
pub fn configure(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_nodelay(true)
}

/// Stream wrapper counting transferred bytes
pub struct CountingStream<S> {
    inner: S,
    counter: Arc<StreamCounter>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counter: Arc<StreamCounter>) -> Self {
        Self { inner, counter }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            self.counter.add_read((buf.filled().len() - before) as u64);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = res {
            self.counter.add_written(written as u64);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
