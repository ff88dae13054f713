//! Host-side persistence of pairing identity: host id, root/host key pair and
//! certificates, and the per-device public key map.
//!
//! This is the ambient persistence layer the original spec treats as an
//! external collaborator (`examples/original_source/src/lockdown.c`'s
//! `userpref_*` functions). `FileTrustStore` is this crate's own reference
//! implementation, grounded on the teacher codebase's general preference for
//! `serde`/`serde_json` for any on-disk state, with a write-temp-then-rename
//! persistence idiom for atomicity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use serde::{Deserialize, Serialize};

use crate::error::LockdownError;

/// Contract consumed by the certificate fabricator (§4.4), pairing state
/// machine (§4.6), and session lifecycle (§4.7/§4.8). Implementations must
/// update `device_uuid -> device_public_key` atomically with respect to
/// concurrent readers (the file-backed reference implementation does this
/// via write-temp-then-rename).
pub trait TrustStore: Send + Sync + std::fmt::Debug {
    fn get_host_id(&self) -> Option<String>;
    fn has_device_public_key(&self, device_uuid: &str) -> bool;
    fn set_device_public_key(&mut self, device_uuid: &str, pem: &[u8]) -> Result<(), LockdownError>;
    fn remove_device_public_key(&mut self, device_uuid: &str) -> Result<(), LockdownError>;
    /// Returns `(root_private_key_pem, root_cert_pem, host_private_key_pem, host_cert_pem)`.
    fn get_keys_and_certs(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>), LockdownError>;
    /// Returns `(root_cert_pem, host_cert_pem)`.
    fn get_certs_as_pem(&self) -> Result<(Vec<u8>, Vec<u8>), LockdownError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    host_id: String,
    root_private_key_pem: String,
    root_cert_pem: String,
    host_private_key_pem: String,
    host_cert_pem: String,
    #[serde(default)]
    device_public_keys: HashMap<String, String>,
}

/// JSON-on-disk reference implementation of `TrustStore`.
#[derive(Debug)]
pub struct FileTrustStore {
    path: PathBuf,
    doc: StoreDocument,
}

impl FileTrustStore {
    /// Loads an existing store from `dir`, or bootstraps a fresh host
    /// identity (host id, 2048-bit RSA root/host keypair, self-signed root
    /// certificate) if none exists yet.
    pub fn open_or_create(dir: impl AsRef<Path>) -> Result<Self, LockdownError> {
        let path = dir.as_ref().join("trust_store.json");
        if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| LockdownError::TrustStore(e.to_string()))?;
            let doc: StoreDocument =
                serde_json::from_slice(&bytes).map_err(|e| LockdownError::TrustStore(e.to_string()))?;
            Ok(FileTrustStore { path, doc })
        } else {
            std::fs::create_dir_all(dir.as_ref()).map_err(|e| LockdownError::TrustStore(e.to_string()))?;
            let doc = bootstrap_identity()?;
            let store = FileTrustStore { path, doc };
            store.persist()?;
            Ok(store)
        }
    }

    fn persist(&self) -> Result<(), LockdownError> {
        let bytes =
            serde_json::to_vec_pretty(&self.doc).map_err(|e| LockdownError::TrustStore(e.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, bytes).map_err(|e| LockdownError::TrustStore(e.to_string()))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| LockdownError::TrustStore(e.to_string()))?;
        Ok(())
    }
}

impl TrustStore for FileTrustStore {
    fn get_host_id(&self) -> Option<String> {
        Some(self.doc.host_id.clone())
    }

    fn has_device_public_key(&self, device_uuid: &str) -> bool {
        self.doc.device_public_keys.contains_key(device_uuid)
    }

    fn set_device_public_key(&mut self, device_uuid: &str, pem: &[u8]) -> Result<(), LockdownError> {
        let encoded = String::from_utf8_lossy(pem).to_string();
        self.doc
            .device_public_keys
            .insert(device_uuid.to_string(), encoded);
        self.persist()
    }

    fn remove_device_public_key(&mut self, device_uuid: &str) -> Result<(), LockdownError> {
        self.doc.device_public_keys.remove(device_uuid);
        self.persist()
    }

    fn get_keys_and_certs(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>), LockdownError> {
        Ok((
            self.doc.root_private_key_pem.clone().into_bytes(),
            self.doc.root_cert_pem.clone().into_bytes(),
            self.doc.host_private_key_pem.clone().into_bytes(),
            self.doc.host_cert_pem.clone().into_bytes(),
        ))
    }

    fn get_certs_as_pem(&self) -> Result<(Vec<u8>, Vec<u8>), LockdownError> {
        Ok((
            self.doc.root_cert_pem.clone().into_bytes(),
            self.doc.host_cert_pem.clone().into_bytes(),
        ))
    }
}

fn bootstrap_identity() -> Result<StoreDocument, LockdownError> {
    let host_id = uuid::Uuid::new_v4().to_string();

    let root_rsa = Rsa::generate(2048)?;
    let root_key = PKey::from_rsa(root_rsa)?;
    let root_cert = self_signed_cert(&root_key, "Lockdownd Pairing Root CA")?;

    let host_rsa = Rsa::generate(2048)?;
    let host_key = PKey::from_rsa(host_rsa)?;
    let host_cert = self_signed_cert(&host_key, "Lockdownd Pairing Host")?;

    Ok(StoreDocument {
        host_id,
        root_private_key_pem: String::from_utf8(root_key.private_key_to_pem_pkcs8()?)
            .expect("PEM is ASCII"),
        root_cert_pem: String::from_utf8(root_cert.to_pem()?).expect("PEM is ASCII"),
        host_private_key_pem: String::from_utf8(host_key.private_key_to_pem_pkcs8()?)
            .expect("PEM is ASCII"),
        host_cert_pem: String::from_utf8(host_cert.to_pem()?).expect("PEM is ASCII"),
        device_public_keys: HashMap::new(),
    })
}

fn self_signed_cert(key: &PKey<openssl::pkey::Private>, cn: &str) -> Result<X509, LockdownError> {
    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = openssl::bn::BigNum::from_u32(1)?;
    builder.set_serial_number(&serial.to_asn1_integer()?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("O", cn)?;
    let name = name.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key)?;

    let not_before = openssl::asn1::Asn1Time::days_from_now(0)?;
    let not_after = openssl::asn1::Asn1Time::days_from_now(3650)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}
