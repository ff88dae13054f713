//! Error taxonomy shared by every operation in this crate.

use thiserror::Error;

/// Everything that can go wrong talking to lockdownd.
#[derive(Error, Debug)]
#[non_exhaustive]
#[repr(i32)]
pub enum LockdownError {
    /// A required input was absent or malformed at the API boundary.
    #[error("invalid argument: {0}")]
    InvalidArg(String) = -1,

    /// The trust store is missing required material (host id / keys / certs).
    #[error("invalid trust store configuration: {0}")]
    InvalidConf(String) = -2,

    /// The response was empty, unparseable, or lacked expected fields.
    #[error("plist protocol error: {0}")]
    Plist(String) = -3,

    /// The device connection could not be established, or send/recv failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error) = -4,

    /// TLS setup, handshake, or encrypted I/O failed.
    #[error("tls error: {0}")]
    Ssl(String) = -5,

    /// The operation requires an active session; none is open.
    #[error("no running session")]
    NoRunningSession = -6,

    /// The device rejected our HostID during StartSession.
    #[error("invalid host id")]
    InvalidHostId = -7,

    /// Pair/ValidatePair/Unpair returned Failure for an unspecified reason.
    #[error("pairing failed: {0}")]
    PairingFailed(String) = -8,

    /// The device is locked with a passcode; pairing was refused.
    #[error("device is password protected")]
    PasswordProtected = -9,

    /// StartService returned Failure or a zero port.
    #[error("start service failed: {0}")]
    StartServiceFailed(String) = -10,

    /// Activate returned Failure.
    #[error("activation failed: {0}")]
    ActivationFailed(String) = -11,

    /// The `TrustStore` implementation reported an I/O or serialization failure.
    #[error("trust store error: {0}")]
    TrustStore(String) = -12,

    /// Catch-all for unclassified protocol deviations.
    #[error("unknown lockdownd error: {0}")]
    UnknownError(String) = -13,
}

impl LockdownError {
    /// Numeric discriminant, mirroring the stable error codes the original
    /// protocol client exposed to callers that match on integers rather than
    /// variants.
    pub fn code(&self) -> i32 {
        match self {
            LockdownError::InvalidArg(_) => -1,
            LockdownError::InvalidConf(_) => -2,
            LockdownError::Plist(_) => -3,
            LockdownError::Transport(_) => -4,
            LockdownError::Ssl(_) => -5,
            LockdownError::NoRunningSession => -6,
            LockdownError::InvalidHostId => -7,
            LockdownError::PairingFailed(_) => -8,
            LockdownError::PasswordProtected => -9,
            LockdownError::StartServiceFailed(_) => -10,
            LockdownError::ActivationFailed(_) => -11,
            LockdownError::TrustStore(_) => -12,
            LockdownError::UnknownError(_) => -13,
        }
    }

    /// Maps the device's `Error` string (sent alongside `Result: Failure`)
    /// to a typed variant. Unrecognized strings fall back to `PairingFailed`
    /// for pairing verbs, or `UnknownError` otherwise.
    pub fn from_pairing_error(device_error: &str) -> Self {
        match device_error {
            "PasswordProtected" => LockdownError::PasswordProtected,
            "InvalidHostID" => LockdownError::InvalidHostId,
            other => LockdownError::PairingFailed(other.to_string()),
        }
    }
}

impl From<plist::Error> for LockdownError {
    fn from(e: plist::Error) -> Self {
        LockdownError::Plist(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for LockdownError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        LockdownError::Ssl(e.to_string())
    }
}

impl From<openssl::ssl::Error> for LockdownError {
    fn from(e: openssl::ssl::Error) -> Self {
        LockdownError::Ssl(e.to_string())
    }
}
