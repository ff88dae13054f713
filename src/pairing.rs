//! The shared Pair / ValidatePair / Unpair state machine.
//!
//! Grounded on `lockdownd_do_pair` in
//! `examples/original_source/src/lockdown.c` and the teacher's own
//! `pair()` in `src/services/lockdown.rs`. All three verbs share this
//! implementation, parameterized by verb name, per SPEC_FULL.md §4.6.

use std::time::SystemTime;

use plist::{Dictionary, Value};

use crate::cert::{generate_pair_certificates, PairCertificates};
use crate::error::LockdownError;
use crate::framing::Channel;
use crate::request::{self, call};
use crate::trust_store::TrustStore;

/// `Pair`, `ValidatePair`, or `Unpair`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairVerb {
    Pair,
    ValidatePair,
    Unpair,
}

impl PairVerb {
    fn as_str(self) -> &'static str {
        match self {
            PairVerb::Pair => "Pair",
            PairVerb::ValidatePair => "ValidatePair",
            PairVerb::Unpair => "Unpair",
        }
    }
}

/// Runs `verb` against the device. On success, the trust store's
/// `device_uuid -> device_public_key` mapping is updated only *after* the
/// device has confirmed success (removed for `Unpair`, set otherwise) —
/// never before, and never rolled back if the device already accepted the
/// device-side pairing but the local store write then fails.
pub async fn run(
    channel: &mut Channel,
    trust_store: &mut dyn TrustStore,
    device_uuid: &str,
    device_public_key_pem: &[u8],
    label: Option<&str>,
    verb: PairVerb,
) -> Result<(), LockdownError> {
    let host_id = trust_store
        .get_host_id()
        .ok_or_else(|| LockdownError::InvalidConf("trust store has no HostID".to_string()))?;

    let (root_key_pem, root_cert_pem, _host_key_pem, host_cert_pem) =
        trust_store.get_keys_and_certs()?;

    let certs: PairCertificates = generate_pair_certificates(
        device_public_key_pem,
        &root_key_pem,
        &root_cert_pem,
        &host_cert_pem,
        SystemTime::now(),
    )?;

    let mut pair_record = Dictionary::new();
    pair_record.insert(
        "DeviceCertificate".to_string(),
        Value::Data(certs.device_cert_pem),
    );
    pair_record.insert(
        "HostCertificate".to_string(),
        Value::Data(certs.host_cert_pem),
    );
    pair_record.insert(
        "RootCertificate".to_string(),
        Value::Data(certs.root_cert_pem),
    );
    pair_record.insert("HostID".to_string(), Value::String(host_id));

    let mut fields = Dictionary::new();
    fields.insert("PairRecord".to_string(), Value::Dictionary(pair_record));

    let response = call(channel, verb.as_str(), fields, label).await?;

    if request::succeeded(&response) {
        match verb {
            PairVerb::Unpair => trust_store.remove_device_public_key(device_uuid)?,
            PairVerb::Pair | PairVerb::ValidatePair => {
                trust_store.set_device_public_key(device_uuid, device_public_key_pem)?
            }
        }
        Ok(())
    } else {
        let device_error = request::error_string(&response).unwrap_or("unknown");
        Err(LockdownError::from_pairing_error(device_error))
    }
}
