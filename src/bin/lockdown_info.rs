//! Thin CLI demonstrating a full handshake against an attached device.
//!
//! Connects to a device-side proxy at `127.0.0.1:<port>` (a USB-mux daemon
//! is expected to be forwarding `LockdownClient::LOCKDOWND_PORT` there; the
//! mux itself is out of scope for this crate), performs a full pairing
//! handshake, and prints a few well-known values.

use std::env;

use lockdownd_client::{FileTrustStore, LockdownClient};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:62078".to_string());

    let trust_dir = env::var("LOCKDOWND_TRUST_DIR").unwrap_or_else(|_| ".lockdownd".to_string());
    let trust_store = Box::new(FileTrustStore::open_or_create(&trust_dir)?);

    let stream = TcpStream::connect(&addr).await?;
    let mut client =
        LockdownClient::new_with_handshake(Box::new(stream), trust_store, Some("lockdown-info".to_string()))
            .await?;

    let name = client.device_name().await?;
    let uuid = client.device_uuid().await?;
    let product_version = client.get_value(None, Some("ProductVersion")).await?;

    println!("DeviceName:     {name}");
    println!("UniqueDeviceID: {uuid}");
    println!("ProductVersion: {product_version:?}");

    client.shutdown().await?;
    Ok(())
}
