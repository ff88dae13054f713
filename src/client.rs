//! `LockdownClient`: the session lifecycle, service launcher, and value
//! operations that make up the public surface of this crate.
//!
//! Grounded on `examples/ZonD80-idevice/idevice/src/services/lockdown.rs`
//! (`LockdownClient`, `get_value`/`set_value`, `start_session`,
//! `start_service`) and `examples/original_source/src/lockdown.c`'s session
//! and service-launch verbs for exact field names and failure semantics.

use log::{debug, warn};
use plist::{Dictionary, Value};

use crate::cert;
use crate::error::LockdownError;
use crate::framing::Channel;
use crate::pairing::{self, PairVerb};
use crate::request::{self, call};
use crate::tls::SslProfile;
use crate::transport::{DeviceConnection, SharedConn};
use crate::trust_store::TrustStore;

/// TCP-equivalent port lockdownd listens on over the device multiplexer.
pub const LOCKDOWND_PORT: u16 = 62078;

/// One attached-device session.
///
/// Owns the plist channel, the trust store handle, and the session's
/// identity state. `session_id` is `Some` iff a `StartSession` has succeeded
/// and `StopSession`/`shutdown` has not yet completed; `channel.is_tls()`
/// implies `session_id.is_some()` but not the reverse (a session without TLS
/// is legal).
#[derive(Debug)]
pub struct LockdownClient {
    channel: Channel,
    trust_store: Box<dyn TrustStore>,
    label: Option<String>,
    session_id: Option<String>,
    device_uuid: Option<String>,
    ssl_profile: SslProfile,
}

impl LockdownClient {
    /// Builds a client around an already-connected device byte stream. Does
    /// not touch the network; callers that want a fully paired, in-session
    /// client should use [`LockdownClient::new_with_handshake`].
    pub fn new(
        conn: Box<dyn DeviceConnection>,
        trust_store: Box<dyn TrustStore>,
        label: Option<String>,
    ) -> Self {
        LockdownClient {
            channel: Channel::new(SharedConn::new(conn)),
            trust_store,
            label,
            session_id: None,
            device_uuid: None,
            ssl_profile: SslProfile::default(),
        }
    }

    /// Performs a full handshake: QueryType, Pair (if the device is not
    /// already trusted), ValidatePair, and StartSession. On any failure the
    /// partially-constructed client is freed best-effort (StopSession, if a
    /// session opened, then Goodbye) before the error is returned, mirroring
    /// `lockdownd_client_free`.
    pub async fn new_with_handshake(
        conn: Box<dyn DeviceConnection>,
        trust_store: Box<dyn TrustStore>,
        label: Option<String>,
    ) -> Result<Self, LockdownError> {
        let mut client = LockdownClient::new(conn, trust_store, label);

        match client.handshake().await {
            Ok(()) => Ok(client),
            Err(e) => {
                if client.session_id.is_some() {
                    let _ = client.stop_session().await;
                }
                let _ = client.goodbye().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), LockdownError> {
        let device_type = self.query_type().await?;
        if device_type != "com.apple.mobile.lockdown" {
            warn!("device reported unexpected lockdown type: {device_type}");
        }

        let uuid = self.device_uuid_value().await?;
        self.device_uuid = Some(uuid.clone());

        if self.trust_store.get_host_id().is_none() {
            return Err(LockdownError::InvalidConf(
                "trust store has no HostID".to_string(),
            ));
        }

        if !self.trust_store.has_device_public_key(&uuid) {
            self.pair().await?;
        }
        self.validate_pair().await?;
        self.start_session().await?;

        Ok(())
    }

    /// The active session id, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether the plist channel is currently TLS-wrapped.
    pub fn is_tls_active(&self) -> bool {
        self.channel.is_tls()
    }

    /// Sets the diagnostic label sent with every request. `None` disables
    /// label insertion entirely.
    pub fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }

    async fn call(&mut self, verb: &str, fields: Dictionary) -> Result<Dictionary, LockdownError> {
        call(&mut self.channel, verb, fields, self.label.as_deref()).await
    }

    /// `QueryType`: returns the device's reported lockdown service type.
    pub async fn query_type(&mut self) -> Result<String, LockdownError> {
        let response = self.call("QueryType", Dictionary::new()).await?;
        response
            .get("Type")
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or_else(|| LockdownError::Plist("QueryType response missing Type".to_string()))
    }

    /// Fetches `domain`/`key` (either may be omitted) via `GetValue`.
    pub async fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<Value, LockdownError> {
        let mut fields = Dictionary::new();
        if let Some(domain) = domain {
            fields.insert("Domain".to_string(), Value::String(domain.to_string()));
        }
        if let Some(key) = key {
            fields.insert("Key".to_string(), Value::String(key.to_string()));
        }
        let response = self.call("GetValue", fields).await?;
        if !request::succeeded(&response) {
            return Err(protocol_failure(&response, "GetValue"));
        }
        response
            .get("Value")
            .cloned()
            .ok_or_else(|| LockdownError::Plist("GetValue response missing Value".to_string()))
    }

    /// Sets `domain`/`key` to `value` via `SetValue`.
    pub async fn set_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
        value: Value,
    ) -> Result<(), LockdownError> {
        let mut fields = Dictionary::new();
        if let Some(domain) = domain {
            fields.insert("Domain".to_string(), Value::String(domain.to_string()));
        }
        if let Some(key) = key {
            fields.insert("Key".to_string(), Value::String(key.to_string()));
        }
        fields.insert("Value".to_string(), value);
        let response = self.call("SetValue", fields).await?;
        if !request::succeeded(&response) {
            return Err(protocol_failure(&response, "SetValue"));
        }
        Ok(())
    }

    /// Removes `domain`/`key` via `RemoveValue`.
    pub async fn remove_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<(), LockdownError> {
        let mut fields = Dictionary::new();
        if let Some(domain) = domain {
            fields.insert("Domain".to_string(), Value::String(domain.to_string()));
        }
        if let Some(key) = key {
            fields.insert("Key".to_string(), Value::String(key.to_string()));
        }
        let response = self.call("RemoveValue", fields).await?;
        if !request::succeeded(&response) {
            return Err(protocol_failure(&response, "RemoveValue"));
        }
        Ok(())
    }

    async fn device_uuid_value(&mut self) -> Result<String, LockdownError> {
        match self.get_value(None, Some("UniqueDeviceID")).await? {
            Value::String(uuid) => Ok(uuid),
            _ => Err(LockdownError::Plist(
                "UniqueDeviceID was not a string".to_string(),
            )),
        }
    }

    /// The device's public key, as returned for `DevicePublicKey` (PKCS#1
    /// `RSA PUBLIC KEY` PEM).
    async fn device_public_key(&mut self) -> Result<Vec<u8>, LockdownError> {
        match self.get_value(None, Some("DevicePublicKey")).await? {
            Value::Data(bytes) => Ok(bytes),
            Value::String(s) => Ok(s.into_bytes()),
            _ => Err(LockdownError::Plist(
                "DevicePublicKey had unexpected type".to_string(),
            )),
        }
    }

    async fn pairing_verb(&mut self, verb: PairVerb) -> Result<(), LockdownError> {
        let device_uuid = match &self.device_uuid {
            Some(uuid) => uuid.clone(),
            None => self.device_uuid_value().await?,
        };
        self.device_uuid = Some(device_uuid.clone());
        let device_public_key = self.device_public_key().await?;

        pairing::run(
            &mut self.channel,
            self.trust_store.as_mut(),
            &device_uuid,
            &device_public_key,
            self.label.as_deref(),
            verb,
        )
        .await
    }

    /// `Pair`: establishes trust with a device seen for the first time.
    pub async fn pair(&mut self) -> Result<(), LockdownError> {
        self.pairing_verb(PairVerb::Pair).await
    }

    /// `ValidatePair`: re-affirms trust with an already-paired device.
    /// Idempotent; safe to call repeatedly.
    pub async fn validate_pair(&mut self) -> Result<(), LockdownError> {
        self.pairing_verb(PairVerb::ValidatePair).await
    }

    /// `Unpair`: revokes trust and removes the device's public key from the
    /// trust store.
    pub async fn unpair(&mut self) -> Result<(), LockdownError> {
        self.pairing_verb(PairVerb::Unpair).await
    }

    /// `StartSession`: requires `HostID` from the trust store. If a session
    /// is already open, stops it first. Enables TLS if the device requests
    /// `EnableSessionSSL`.
    pub async fn start_session(&mut self) -> Result<(), LockdownError> {
        if self.session_id.is_some() {
            self.stop_session().await?;
        }

        let host_id = self
            .trust_store
            .get_host_id()
            .ok_or_else(|| LockdownError::InvalidConf("trust store has no HostID".to_string()))?;

        let mut fields = Dictionary::new();
        fields.insert("HostID".to_string(), Value::String(host_id));

        let response = self.call("StartSession", fields).await?;
        if !request::succeeded(&response) {
            let device_error = request::error_string(&response).unwrap_or("unknown");
            if device_error == "InvalidHostID" {
                return Err(LockdownError::InvalidHostId);
            }
            return Err(LockdownError::UnknownError(format!(
                "StartSession failed: {device_error}"
            )));
        }

        let session_id = response
            .get("SessionID")
            .and_then(Value::as_string)
            .ok_or_else(|| LockdownError::Plist("StartSession missing SessionID".to_string()))?
            .to_string();
        self.session_id = Some(session_id);

        let enable_ssl = response
            .get("EnableSessionSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        if enable_ssl {
            let (_, _, host_key_pem, host_cert_pem) = self.trust_store.get_keys_and_certs()?;
            self.channel
                .upgrade_tls(&self.ssl_profile, &host_cert_pem, &host_key_pem)
                .await?;
        }

        Ok(())
    }

    /// `StopSession`: requires a known session id. Always disables TLS
    /// afterwards, mirroring `lockdownd_ssl_stop_session` being called
    /// unconditionally after the StopSession round-trip.
    pub async fn stop_session(&mut self) -> Result<(), LockdownError> {
        let session_id = match self.session_id.take() {
            Some(id) => id,
            None => return Err(LockdownError::NoRunningSession),
        };

        let mut fields = Dictionary::new();
        fields.insert("SessionID".to_string(), Value::String(session_id));
        let result = self.call("StopSession", fields).await;

        self.channel.downgrade_tls().await?;

        result.map(|_| ())
    }

    /// `Goodbye`: informs the device the session is ending.
    pub async fn goodbye(&mut self) -> Result<(), LockdownError> {
        let response = self.call("Goodbye", Dictionary::new()).await?;
        if !request::succeeded(&response) {
            return Err(protocol_failure(&response, "Goodbye"));
        }
        Ok(())
    }

    /// Best-effort teardown: StopSession (if a session is open) then
    /// Goodbye, in that order, regardless of intermediate failures. Returns
    /// the first error encountered, if any, after attempting every step.
    pub async fn shutdown(mut self) -> Result<(), LockdownError> {
        let mut first_error = None;

        if self.session_id.is_some() {
            if let Err(e) = self.stop_session().await {
                first_error = Some(e);
            }
        }

        if let Err(e) = self.goodbye().await {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `StartService`: requires an active session. Returns the device-side
    /// multiplexer port the named service is listening on.
    pub async fn start_service(&mut self, name: &str) -> Result<u16, LockdownError> {
        if self.session_id.is_none() {
            return Err(LockdownError::NoRunningSession);
        }
        self.trust_store
            .get_host_id()
            .ok_or_else(|| LockdownError::InvalidConf("trust store has no HostID".to_string()))?;

        let mut fields = Dictionary::new();
        fields.insert("Service".to_string(), Value::String(name.to_string()));
        let response = self.call("StartService", fields).await?;

        if !request::succeeded(&response) {
            let device_error = request::error_string(&response).unwrap_or("unknown").to_string();
            return Err(LockdownError::StartServiceFailed(device_error));
        }

        let port = response
            .get("Port")
            .and_then(Value::as_unsigned_integer)
            .unwrap_or(0);
        if port == 0 || port > u16::MAX as u64 {
            return Err(LockdownError::StartServiceFailed(format!(
                "invalid port {port}"
            )));
        }
        Ok(port as u16)
    }

    /// Reboots the device into recovery mode. The current session is
    /// effectively terminated by the device after this call.
    pub async fn enter_recovery(&mut self) -> Result<(), LockdownError> {
        let response = self.call("EnterRecovery", Dictionary::new()).await?;
        if !request::succeeded(&response) {
            return Err(protocol_failure(&response, "EnterRecovery"));
        }
        Ok(())
    }

    /// `Activate`: session-scoped device commissioning with an activation
    /// record produced by the activation service.
    pub async fn activate(&mut self, activation_record: Value) -> Result<(), LockdownError> {
        if self.session_id.is_none() {
            return Err(LockdownError::NoRunningSession);
        }
        let mut fields = Dictionary::new();
        fields.insert("ActivationRecord".to_string(), activation_record);
        let response = self.call("Activate", fields).await?;
        if !request::succeeded(&response) {
            let device_error = request::error_string(&response).unwrap_or("unknown").to_string();
            return Err(LockdownError::ActivationFailed(device_error));
        }
        Ok(())
    }

    /// `Deactivate`: session-scoped device decommissioning.
    pub async fn deactivate(&mut self) -> Result<(), LockdownError> {
        if self.session_id.is_none() {
            return Err(LockdownError::NoRunningSession);
        }
        let response = self.call("Deactivate", Dictionary::new()).await?;
        if !request::succeeded(&response) {
            let device_error = request::error_string(&response).unwrap_or("unknown").to_string();
            return Err(LockdownError::ActivationFailed(device_error));
        }
        Ok(())
    }

    /// Convenience wrapper over `GetValue(nil, "DeviceName")`.
    pub async fn device_name(&mut self) -> Result<String, LockdownError> {
        match self.get_value(None, Some("DeviceName")).await? {
            Value::String(name) => Ok(name),
            _ => Err(LockdownError::Plist(
                "DeviceName was not a string".to_string(),
            )),
        }
    }

    /// Convenience wrapper caching `GetValue(nil, "UniqueDeviceID")`.
    pub async fn device_uuid(&mut self) -> Result<String, LockdownError> {
        if let Some(uuid) = &self.device_uuid {
            return Ok(uuid.clone());
        }
        let uuid = self.device_uuid_value().await?;
        self.device_uuid = Some(uuid.clone());
        Ok(uuid)
    }
}

impl Drop for LockdownClient {
    fn drop(&mut self) {
        if self.session_id.is_some() {
            warn!(
                "LockdownClient dropped with an open session ({:?}); call shutdown() to close it cleanly",
                self.session_id
            );
        }
    }
}

fn protocol_failure(response: &Dictionary, verb: &str) -> LockdownError {
    let device_error = request::error_string(response).unwrap_or("unknown");
    debug!("{verb} failed: {device_error}");
    LockdownError::UnknownError(format!("{verb} failed: {device_error}"))
}

// Re-exported so callers can build certificates directly if they need to
// (e.g. to pre-seed a trust store), without reaching into `cert` themselves.
pub use cert::PairCertificates;
