//! End-to-end scenarios from SPEC_FULL.md §8, driven against an in-memory
//! fake lockdownd speaking the same framed-plist protocol over a
//! `tokio::io::duplex` pair. TLS upgrade is exercised at the unit level in
//! `src/tls.rs`/`src/cert.rs`; these scenarios pin `EnableSessionSSL: false`
//! so the wire-level assertions here don't also need a TLS server partner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};
use plist::{Dictionary, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use lockdownd_client::error::LockdownError;
use lockdownd_client::trust_store::TrustStore;
use lockdownd_client::LockdownClient;

/// A trust store backed by plain in-memory fields, so tests can assert on
/// its mutations directly without touching a filesystem.
#[derive(Debug, Clone)]
struct TestTrustStore {
    host_id: String,
    root_key_pem: Vec<u8>,
    root_cert_pem: Vec<u8>,
    host_key_pem: Vec<u8>,
    host_cert_pem: Vec<u8>,
    device_keys: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl TestTrustStore {
    fn new() -> Self {
        let (root_key_pem, root_cert_pem) = self_signed("Test Root");
        let (host_key_pem, host_cert_pem) = self_signed("Test Host");
        TestTrustStore {
            host_id: "test-host-id".to_string(),
            root_key_pem,
            root_cert_pem,
            host_key_pem,
            host_cert_pem,
            device_keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn has_key(&self, uuid: &str) -> bool {
        self.device_keys.lock().unwrap().contains_key(uuid)
    }
}

impl TrustStore for TestTrustStore {
    fn get_host_id(&self) -> Option<String> {
        Some(self.host_id.clone())
    }

    fn has_device_public_key(&self, device_uuid: &str) -> bool {
        self.device_keys.lock().unwrap().contains_key(device_uuid)
    }

    fn set_device_public_key(&mut self, device_uuid: &str, pem: &[u8]) -> Result<(), LockdownError> {
        self.device_keys
            .lock()
            .unwrap()
            .insert(device_uuid.to_string(), pem.to_vec());
        Ok(())
    }

    fn remove_device_public_key(&mut self, device_uuid: &str) -> Result<(), LockdownError> {
        self.device_keys.lock().unwrap().remove(device_uuid);
        Ok(())
    }

    fn get_keys_and_certs(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>), LockdownError> {
        Ok((
            self.root_key_pem.clone(),
            self.root_cert_pem.clone(),
            self.host_key_pem.clone(),
            self.host_cert_pem.clone(),
        ))
    }

    fn get_certs_as_pem(&self) -> Result<(Vec<u8>, Vec<u8>), LockdownError> {
        Ok((self.root_cert_pem.clone(), self.host_cert_pem.clone()))
    }
}

fn self_signed(cn: &str) -> (Vec<u8>, Vec<u8>) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = openssl::bn::BigNum::from_u32(1).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("O", cn).unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    let not_before = openssl::asn1::Asn1Time::days_from_now(0).unwrap();
    let not_after = openssl::asn1::Asn1Time::days_from_now(3650).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (
        key.private_key_to_pem_pkcs8().unwrap(),
        builder.build().to_pem().unwrap(),
    )
}

async fn read_frame(stream: &mut DuplexStream) -> Dictionary {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf);
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.unwrap();
    plist::from_bytes::<Value>(&body)
        .unwrap()
        .into_dictionary()
        .unwrap()
}

async fn write_frame(stream: &mut DuplexStream, dict: Dictionary) {
    let mut body = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();
    stream.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();
}

fn success(request: &str, extra: Dictionary) -> Dictionary {
    let mut d = extra;
    d.insert("Request".to_string(), Value::String(request.to_string()));
    d.insert("Result".to_string(), Value::String("Success".to_string()));
    d
}

fn failure(request: &str, error: &str) -> Dictionary {
    let mut d = Dictionary::new();
    d.insert("Request".to_string(), Value::String(request.to_string()));
    d.insert("Result".to_string(), Value::String("Failure".to_string()));
    d.insert("Error".to_string(), Value::String(error.to_string()));
    d
}

fn device_public_key_pem() -> Vec<u8> {
    let rsa = Rsa::generate(2048).unwrap();
    rsa.public_key_to_pem_pkcs1().unwrap()
}

/// Scenario 1 (minus TLS) + scenario 2: fresh-device handshake pairs, then a
/// second handshake against the same device uuid only validates.
#[tokio::test]
async fn fresh_then_repeat_handshake() {
    let (client_stream, mut device_stream) = tokio::io::duplex(64 * 1024);
    let trust_store = TestTrustStore::new();
    let device_pub = device_public_key_pem();

    let device_task = {
        let device_pub = device_pub.clone();
        tokio::spawn(async move {
            // QueryType
            let req = read_frame(&mut device_stream).await;
            assert_eq!(req.get("Request").unwrap().as_string().unwrap(), "QueryType");
            let mut resp = Dictionary::new();
            resp.insert("Request".to_string(), Value::String("QueryType".to_string()));
            resp.insert(
                "Type".to_string(),
                Value::String("com.apple.mobile.lockdown".to_string()),
            );
            write_frame(&mut device_stream, resp).await;

            // GetValue UniqueDeviceID
            let req = read_frame(&mut device_stream).await;
            assert_eq!(req.get("Key").unwrap().as_string().unwrap(), "UniqueDeviceID");
            let mut extra = Dictionary::new();
            extra.insert("Value".to_string(), Value::String("1111-2222".to_string()));
            write_frame(&mut device_stream, success("GetValue", extra)).await;

            // GetValue DevicePublicKey (for Pair)
            let req = read_frame(&mut device_stream).await;
            assert_eq!(req.get("Key").unwrap().as_string().unwrap(), "DevicePublicKey");
            let mut extra = Dictionary::new();
            extra.insert("Value".to_string(), Value::Data(device_pub.clone()));
            write_frame(&mut device_stream, success("GetValue", extra)).await;

            // Pair
            let req = read_frame(&mut device_stream).await;
            assert_eq!(req.get("Request").unwrap().as_string().unwrap(), "Pair");
            assert!(req.get("PairRecord").unwrap().as_dictionary().is_some());
            write_frame(&mut device_stream, success("Pair", Dictionary::new())).await;

            // GetValue DevicePublicKey (for ValidatePair)
            let req = read_frame(&mut device_stream).await;
            assert_eq!(req.get("Key").unwrap().as_string().unwrap(), "DevicePublicKey");
            let mut extra = Dictionary::new();
            extra.insert("Value".to_string(), Value::Data(device_pub.clone()));
            write_frame(&mut device_stream, success("GetValue", extra)).await;

            // ValidatePair
            let req = read_frame(&mut device_stream).await;
            assert_eq!(req.get("Request").unwrap().as_string().unwrap(), "ValidatePair");
            write_frame(&mut device_stream, success("ValidatePair", Dictionary::new())).await;

            // StartSession, no TLS
            let req = read_frame(&mut device_stream).await;
            assert_eq!(req.get("Request").unwrap().as_string().unwrap(), "StartSession");
            assert_eq!(req.get("HostID").unwrap().as_string().unwrap(), "test-host-id");
            let mut extra = Dictionary::new();
            extra.insert("SessionID".to_string(), Value::String("S1".to_string()));
            extra.insert("EnableSessionSSL".to_string(), Value::Boolean(false));
            write_frame(&mut device_stream, success("StartSession", extra)).await;

            device_stream
        })
    };

    let mut client = LockdownClient::new_with_handshake(
        Box::new(client_stream),
        Box::new(trust_store.clone()),
        Some("test".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(client.session_id(), Some("S1"));
    assert!(!client.is_tls_active());
    assert!(trust_store.has_key("1111-2222"));

    let mut device_stream = device_task.await.unwrap();

    // Scenario 5 teardown ordering: StopSession request observed before the
    // connection half-closes on Goodbye.
    let stop_and_goodbye = tokio::spawn(async move {
        let req = read_frame(&mut device_stream).await;
        assert_eq!(req.get("Request").unwrap().as_string().unwrap(), "StopSession");
        assert_eq!(req.get("SessionID").unwrap().as_string().unwrap(), "S1");
        write_frame(&mut device_stream, success("StopSession", Dictionary::new())).await;

        let req = read_frame(&mut device_stream).await;
        assert_eq!(req.get("Request").unwrap().as_string().unwrap(), "Goodbye");
        write_frame(&mut device_stream, success("Goodbye", Dictionary::new())).await;
    });

    client.shutdown().await.unwrap();
    stop_and_goodbye.await.unwrap();
}

/// Scenario 3: a locked device refuses Pair with `PasswordProtected`, and
/// the trust store is left untouched.
#[tokio::test]
async fn locked_device_refuses_pairing() {
    let (client_stream, mut device_stream) = tokio::io::duplex(64 * 1024);
    let trust_store = TestTrustStore::new();
    let device_pub = device_public_key_pem();

    tokio::spawn(async move {
        let _ = read_frame(&mut device_stream).await; // QueryType
        let mut resp = Dictionary::new();
        resp.insert("Request".to_string(), Value::String("QueryType".to_string()));
        resp.insert(
            "Type".to_string(),
            Value::String("com.apple.mobile.lockdown".to_string()),
        );
        write_frame(&mut device_stream, resp).await;

        let _ = read_frame(&mut device_stream).await; // GetValue UniqueDeviceID
        let mut extra = Dictionary::new();
        extra.insert("Value".to_string(), Value::String("9999-0000".to_string()));
        write_frame(&mut device_stream, success("GetValue", extra)).await;

        let _ = read_frame(&mut device_stream).await; // GetValue DevicePublicKey
        let mut extra = Dictionary::new();
        extra.insert("Value".to_string(), Value::Data(device_pub));
        write_frame(&mut device_stream, success("GetValue", extra)).await;

        let _ = read_frame(&mut device_stream).await; // Pair
        write_frame(&mut device_stream, failure("Pair", "PasswordProtected")).await;
    });

    let err = LockdownClient::new_with_handshake(
        Box::new(client_stream),
        Box::new(trust_store.clone()),
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, LockdownError::PasswordProtected));
    assert!(!trust_store.has_key("9999-0000"));
}

/// Scenario 4: StartService routes to the port the device reports.
#[tokio::test]
async fn start_service_returns_reported_port() {
    let (client_stream, mut device_stream) = tokio::io::duplex(64 * 1024);
    let trust_store = TestTrustStore::new();
    let mut client = lockdownd_client::LockdownClient::new(
        Box::new(client_stream),
        Box::new(trust_store),
        Some("test".to_string()),
    );

    // Drive a bare StartSession by hand so start_service's precondition
    // (an open session) is satisfied, without running the full pairing
    // handshake this test isn't exercising.
    let device_task = tokio::spawn(async move {
        let req = read_frame(&mut device_stream).await;
        assert_eq!(req.get("Request").unwrap().as_string().unwrap(), "StartSession");
        let mut extra = Dictionary::new();
        extra.insert("SessionID".to_string(), Value::String("S1".to_string()));
        extra.insert("EnableSessionSSL".to_string(), Value::Boolean(false));
        write_frame(&mut device_stream, success("StartSession", extra)).await;

        let req = read_frame(&mut device_stream).await;
        assert_eq!(req.get("Request").unwrap().as_string().unwrap(), "StartService");
        assert_eq!(req.get("Service").unwrap().as_string().unwrap(), "com.apple.afc");
        let mut extra = Dictionary::new();
        extra.insert("Port".to_string(), Value::Integer(4242u64.into()));
        write_frame(&mut device_stream, success("StartService", extra)).await;
        device_stream
    });

    client.start_session().await.unwrap();
    let port = client.start_service("com.apple.afc").await.unwrap();
    assert_eq!(port, 4242);

    device_task.await.unwrap();
}

/// A session-scoped operation attempted with no open session fails fast and
/// emits no request at all.
#[tokio::test]
async fn start_service_without_session_is_rejected() {
    let (client_stream, _device_stream) = tokio::io::duplex(64 * 1024);
    let trust_store = TestTrustStore::new();
    let mut client = lockdownd_client::LockdownClient::new(
        Box::new(client_stream),
        Box::new(trust_store),
        None,
    );

    let err = client.start_service("com.apple.afc").await.unwrap_err();
    assert!(matches!(err, LockdownError::NoRunningSession));
}
