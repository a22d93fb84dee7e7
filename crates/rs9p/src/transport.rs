//! Byte-stream transport abstraction.
//!
//! A 9P connection is built on top of any pair of stream endpoints: a TCP socket, a
//! Unix-domain socket, or in principle any other `AsyncRead + AsyncWrite` pair (a pipe,
//! a socketpair passed down by a mount helper). The codec's framing loop only ever needs
//! read/write/shutdown, so this module exposes that surface as a single blanket trait
//! rather than the function-pointer vtable the original C implementation used for its
//! `Nptrans` abstraction.

use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UnixStream},
};

use crate::utils;

/// Anything that can carry 9P frames: read the bytes of one direction, write the bytes
/// of the other. The framing loop in `connection` retries partial reads/writes itself;
/// a `Transport` only has to be a faithful byte pipe.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Set the socket options the reference stack's client helper applies to every TCP
/// connection: disable Nagle's algorithm (9P frames are usually small and
/// latency-sensitive) and enable keepalives so a half-open peer is eventually noticed.
pub fn tune_tcp_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

/// Connect to a 9P address of the form `tcp!host!port` or `unix!path!suffix`, the same
/// address grammar the server side's listeners accept.
///
/// `suffix` in the Unix form is accepted but ignored (it exists only so the
/// `proto!addr!port` three-field grammar stays uniform across transports).
pub async fn connect(addr: &str) -> io::Result<Box<dyn Transport>> {
    let (proto, host, port) = utils::parse_proto(addr)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid proto!addr!port"))?;

    match proto {
        "tcp" => {
            let stream = TcpStream::connect((host, port.parse::<u16>().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid port")
            })?))
            .await?;
            tune_tcp_stream(&stream)?;
            Ok(Box::new(stream))
        }
        "unix" => {
            let stream = UnixStream::connect(host).await?;
            Ok(Box::new(stream))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported transport protocol: {other}"),
        )),
    }
}

/// Half-close the write side, signalling the peer no cleanup is coming.
pub async fn shutdown<W: AsyncWrite + Unpin>(w: &mut W) -> io::Result<()> {
    w.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_rejects_unknown_protocol() {
        let err = connect("sctp!localhost!1234").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn connect_rejects_malformed_address() {
        let err = connect("tcp!onlyhost").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
