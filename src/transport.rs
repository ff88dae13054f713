//! The external device connection, abstracted as a byte stream.
//!
//! The USB-mux-style multiplexed transport that actually carries these bytes
//! to the device is out of scope for this crate; anything that behaves like
//! an ordered, reliable async byte stream (a `TcpStream`, a `UnixStream`, or
//! an in-memory `DuplexStream` in tests) works here for free.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::LockdownError;

/// Marker trait for anything usable as the device-side byte stream.
///
/// Blanket-implemented for any `AsyncRead + AsyncWrite` type so callers never
/// need to implement it by hand.
pub trait DeviceConnection: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug> DeviceConnection for T {}

/// A cheaply-cloneable handle to a boxed device connection.
///
/// The TLS session (`tls.rs`) needs to take ownership of a stream to hand to
/// `tokio_openssl::SslStream`, but StopSession later requires going back to
/// plaintext I/O on the very same byte stream (`lockdown.c`'s
/// `lockdownd_ssl_stop_session` relies on gnutls wrapping the socket through
/// external push/pull callbacks rather than owning it, so disabling SSL is
/// just "stop calling gnutls"). `SharedConn` re-creates that property for an
/// owning Rust API: every clone refers to the same underlying connection, so
/// dropping the TLS wrapper simply stops routing bytes through OpenSSL and
/// the plain handle keeps working. The single-task invariant in §5 of the
/// design (no two in-flight calls on one client) means the inner mutex is
/// never contended.
#[derive(Debug, Clone)]
pub struct SharedConn(Arc<Mutex<Box<dyn DeviceConnection>>>);

impl SharedConn {
    pub fn new(conn: Box<dyn DeviceConnection>) -> Self {
        SharedConn(Arc::new(Mutex::new(conn)))
    }
}

impl AsyncRead for SharedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut guard = self.0.lock().expect("device connection mutex poisoned");
        Pin::new(&mut **guard).poll_read(cx, buf)
    }
}

impl AsyncWrite for SharedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut guard = self.0.lock().expect("device connection mutex poisoned");
        Pin::new(&mut **guard).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut guard = self.0.lock().expect("device connection mutex poisoned");
        Pin::new(&mut **guard).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut guard = self.0.lock().expect("device connection mutex poisoned");
        Pin::new(&mut **guard).poll_shutdown(cx)
    }
}

/// Reads exactly `buf.len()` bytes from `conn`, looping over short reads.
///
/// The device connection may deliver fewer bytes than requested on any given
/// poll; this loop keeps pulling until the buffer is full or the connection
/// errors (including a clean EOF before the buffer is full, which is treated
/// as an `UnexpectedEof` transport error).
pub async fn recv_exact(
    conn: &mut (dyn DeviceConnection),
    buf: &mut [u8],
) -> Result<(), LockdownError> {
    conn.read_exact(buf)
        .await
        .map_err(LockdownError::Transport)?;
    Ok(())
}

/// Writes the entirety of `buf` to `conn`, looping over short writes.
pub async fn send_all(conn: &mut (dyn DeviceConnection), buf: &[u8]) -> Result<(), LockdownError> {
    conn.write_all(buf).await.map_err(LockdownError::Transport)?;
    conn.flush().await.map_err(LockdownError::Transport)?;
    Ok(())
}
