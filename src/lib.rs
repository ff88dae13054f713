//! A client for the lockdownd device control and pairing protocol.
//!
//! This crate implements the request/response engine, the pairing and
//! trust-establishment state machine, and the session lifecycle spoken
//! against a mobile device's administrative daemon over a muxed,
//! length-prefixed, property-list-over-TLS protocol. The underlying
//! multiplexed device transport and the plist wire codec itself are treated
//! as external collaborators; see [`transport::DeviceConnection`] and the
//! `plist` crate, respectively.
//!
//! ```no_run
//! use lockdownd_client::{LockdownClient, FileTrustStore};
//!
//! # async fn handshake(conn: Box<dyn lockdownd_client::transport::DeviceConnection>) -> Result<(), lockdownd_client::LockdownError> {
//! let trust_store = Box::new(FileTrustStore::open_or_create("./lockdownd-trust")?);
//! let mut client = LockdownClient::new_with_handshake(conn, trust_store, Some("example".to_string())).await?;
//! let name = client.device_name().await?;
//! println!("connected to {name}");
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cert;
pub mod client;
pub mod error;
pub mod framing;
pub mod pairing;
pub mod request;
pub mod tls;
pub mod transport;
pub mod trust_store;

pub use client::{LockdownClient, LOCKDOWND_PORT};
pub use error::LockdownError;
pub use trust_store::{FileTrustStore, TrustStore};
