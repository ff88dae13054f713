//! Device certificate fabrication for the pairing handshake.
//!
//! Grounded on `lockdownd_gen_pair_cert` in
//! `examples/original_source/src/lockdown.c` for the exact certificate
//! fields (serial, version, validity window), and on the `X509::builder()`
//! idiom in
//! `examples/other_examples/4538e9b0_zhxie-ztunnel__src-tls-openssl.rs.rs`
//! for how to express it against the `openssl` crate.
//!
//! The original decodes the device's PKCS#1 RSA public key by hand (base64
//! decode, then a libtasn1 walk over `SEQUENCE { modulus, publicExponent }`)
//! and then builds a "fake" private key so that gnutls's
//! `gnutls_x509_crt_set_key` has something to attach — the private
//! components are never used to sign anything, so the fake key is
//! write-only. OpenSSL's `X509Builder::set_pubkey` takes a `PKey<Public>`
//! directly, so this crate skips the fake-private-key step entirely; see
//! DESIGN.md.

use std::time::{Duration, SystemTime};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::X509;

use crate::error::LockdownError;

/// Ten years, matching `lockdownd_gen_pair_cert`'s
/// `time(NULL) + (60 * 60 * 24 * 365 * 10)`.
const VALIDITY: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 10);

/// The three PEM-encoded certificates exchanged during Pair/ValidatePair.
#[derive(Debug, Clone)]
pub struct PairCertificates {
    pub device_cert_pem: Vec<u8>,
    pub host_cert_pem: Vec<u8>,
    pub root_cert_pem: Vec<u8>,
}

/// Fabricates a device certificate for `device_public_key_pem` (the PKCS#1
/// `RSA PUBLIC KEY` PEM the device returns for `DevicePublicKey`), signed by
/// the host's root key from the trust store.
///
/// `not_before` is taken as a parameter (rather than read from the clock
/// internally) so tests can freeze time and compare output deterministically
/// modulo nothing at all.
pub fn generate_pair_certificates(
    device_public_key_pem: &[u8],
    root_key_pem: &[u8],
    root_cert_pem: &[u8],
    host_cert_pem: &[u8],
    not_before: SystemTime,
) -> Result<PairCertificates, LockdownError> {
    if device_public_key_pem.is_empty() {
        return Err(LockdownError::InvalidArg(
            "device public key is empty".to_string(),
        ));
    }

    let device_key = device_public_key(device_public_key_pem)?;
    let root_key = PKey::private_key_from_pem(root_key_pem)?;
    let root_cert = X509::from_pem(root_cert_pem)?;

    let device_cert = build_device_certificate(&device_key, &root_key, &root_cert, not_before)?;

    Ok(PairCertificates {
        device_cert_pem: device_cert.to_pem()?,
        host_cert_pem: host_cert_pem.to_vec(),
        root_cert_pem: root_cert_pem.to_vec(),
    })
}

/// Parses a PKCS#1 `RSA PUBLIC KEY` PEM into a public-only key object.
///
/// OpenSSL's PKCS#1 PEM parser performs the base64 decode and the
/// `SEQUENCE { modulus INTEGER, publicExponent INTEGER }` ASN.1 walk that
/// `lockdownd_gen_pair_cert` does by hand against libtasn1.
fn device_public_key(pem: &[u8]) -> Result<PKey<Public>, LockdownError> {
    let rsa = Rsa::public_key_from_pem_pkcs1(pem)
        .or_else(|_| Rsa::public_key_from_pem(pem))
        .map_err(|e| LockdownError::InvalidArg(format!("invalid device public key: {e}")))?;
    let n = rsa.n().to_owned()?;
    let e = rsa.e().to_owned()?;
    let public_only = Rsa::from_public_components(n, e)?;
    Ok(PKey::from_rsa(public_only)?)
}

fn build_device_certificate(
    device_key: &PKey<Public>,
    root_key: &PKey<Private>,
    root_cert: &X509,
    not_before: SystemTime,
) -> Result<X509, LockdownError> {
    let mut builder = X509::builder()?;

    // `gnutls_x509_crt_set_serial(dev_cert, "\x00", 1)` — a single zero byte.
    let serial = BigNum::from_slice(&[0u8])?;
    builder.set_serial_number(&serial.to_asn1_integer()?)?;

    // `gnutls_x509_crt_set_version(dev_cert, 3)` (internal field value is
    // zero-indexed, so v3 is encoded as 2).
    builder.set_version(2)?;

    builder.set_pubkey(device_key)?;
    builder.set_issuer_name(root_cert.subject_name())?;
    // `lockdownd_gen_pair_cert` never calls a subject-setting function on
    // dev_cert; its subject name stays empty. No subject name is set here
    // either.

    // `gnutls_x509_crt_set_ca_status(dev_cert, 0)`.
    builder.append_extension(BasicConstraints::new().critical().build()?)?;

    let not_before_asn1 = system_time_to_asn1(not_before)?;
    builder.set_not_before(&not_before_asn1)?;
    let not_after_asn1 = system_time_to_asn1(not_before + VALIDITY)?;
    builder.set_not_after(&not_after_asn1)?;

    builder.sign(root_key, MessageDigest::sha256())?;

    Ok(builder.build())
}

fn system_time_to_asn1(time: SystemTime) -> Result<Asn1Time, LockdownError> {
    let secs = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|_| LockdownError::InvalidArg("time before the unix epoch".to_string()))?
        .as_secs();
    Asn1Time::from_unix(secs as i64).map_err(LockdownError::from)
}
