//! Length-prefixed plist framing, plaintext or TLS-wrapped.
//!
//! Grounded on `send_plist`/`read_plist` in
//! `examples/other_examples/2e1953ff_..._idevice-src-lib.rs.rs`: every
//! message is a 32-bit big-endian length followed by that many bytes of XML
//! plist. After `StartSession` enables TLS, the same framing travels inside
//! the TLS session instead of directly over the raw connection — the length
//! prefix itself becomes ciphertext, it is not a TLS record boundary.

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_openssl::SslStream;

use crate::error::LockdownError;
use crate::tls::{self, SslProfile};
use crate::transport::SharedConn;

const MAX_MESSAGE_LEN: u32 = 64 * 1024 * 1024;

/// The lockdownd byte channel: plaintext until `StartSession` enables TLS,
/// optionally plaintext again after `StopSession` disables it.
#[derive(Debug)]
pub enum Channel {
    Plain(SharedConn),
    Tls(Box<SslStream<SharedConn>>),
}

impl Channel {
    pub fn new(conn: SharedConn) -> Self {
        Channel::Plain(conn)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Channel::Tls(_))
    }

    /// Upgrades the channel in place by performing a TLS handshake over the
    /// same underlying connection. The plaintext `SharedConn` handle used
    /// beforehand keeps working once the TLS wrapper is later dropped.
    pub async fn upgrade_tls(
        &mut self,
        profile: &SslProfile,
        host_cert_pem: &[u8],
        host_key_pem: &[u8],
    ) -> Result<(), LockdownError> {
        let conn = match self {
            Channel::Plain(conn) => conn.clone(),
            Channel::Tls(_) => return Ok(()),
        };
        let stream = tls::handshake(conn, profile, host_cert_pem, host_key_pem).await?;
        *self = Channel::Tls(Box::new(stream));
        Ok(())
    }

    /// Sends a TLS close-notify and falls back to plaintext I/O on the same
    /// connection. No-op if TLS was never enabled.
    pub async fn downgrade_tls(&mut self) -> Result<(), LockdownError> {
        let conn = match self {
            Channel::Plain(_) => return Ok(()),
            Channel::Tls(stream) => {
                tls::close_notify(stream).await?;
                stream.get_ref().clone()
            }
        };
        *self = Channel::Plain(conn);
        Ok(())
    }

    pub async fn send_plist(&mut self, value: &plist::Value) -> Result<(), LockdownError> {
        let mut body = Vec::new();
        value.to_writer_xml(&mut body)?;
        if body.len() as u64 > MAX_MESSAGE_LEN as u64 {
            return Err(LockdownError::Plist(
                "outgoing plist exceeds maximum frame size".to_string(),
            ));
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, body.len() as u32);
        frame.extend_from_slice(&len_buf);
        frame.extend_from_slice(&body);

        match self {
            Channel::Plain(conn) => {
                conn.write_all(&frame).await.map_err(LockdownError::Transport)?;
                conn.flush().await.map_err(LockdownError::Transport)?;
            }
            Channel::Tls(stream) => {
                stream
                    .write_all(&frame)
                    .await
                    .map_err(|e| LockdownError::Ssl(e.to_string()))?;
                stream
                    .flush()
                    .await
                    .map_err(|e| LockdownError::Ssl(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub async fn recv_plist(&mut self) -> Result<plist::Value, LockdownError> {
        let mut len_buf = [0u8; 4];
        match self {
            Channel::Plain(conn) => conn
                .read_exact(&mut len_buf)
                .await
                .map_err(LockdownError::Transport)?,
            Channel::Tls(stream) => stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| LockdownError::Ssl(e.to_string()))?,
        };
        let len = BigEndian::read_u32(&len_buf);
        if len == 0 {
            return Err(LockdownError::Plist("received empty response frame".to_string()));
        }
        if len > MAX_MESSAGE_LEN {
            return Err(LockdownError::Plist(
                "incoming plist exceeds maximum frame size".to_string(),
            ));
        }

        let mut body = vec![0u8; len as usize];
        match self {
            Channel::Plain(conn) => conn
                .read_exact(&mut body)
                .await
                .map_err(LockdownError::Transport)?,
            Channel::Tls(stream) => stream
                .read_exact(&mut body)
                .await
                .map_err(|e| LockdownError::Ssl(e.to_string()))?,
        };

        let value = plist::from_bytes(&body)?;
        Ok(value)
    }
}
