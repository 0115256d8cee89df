//! Read the spool tag on a serial reader and print it
//!
//! `SPOOLRFID_PORT` selects the port; otherwise the first enumerated port is
//! used. `RUST_LOG=spoolrfid=debug` shows every session state change.

use anyhow::Context;
use spoolrfid::{DeviceDescriptor, DeviceRegistry, Reader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let path = match std::env::var("SPOOLRFID_PORT") {
        Ok(path) => path,
        Err(_) => DeviceRegistry::global()
            .discover()?
            .first()
            .map(|d| d.path.clone())
            .context("no serial ports found, set SPOOLRFID_PORT")?,
    };

    println!("Opening reader on {}...", path);
    let reader = Reader::serial(DeviceDescriptor::new(path));

    let mut session = reader.start_session().await?;
    let firmware = session.firmware_version().await?;
    println!("✓ Firmware: {}", firmware);

    let record = session.read_spool().await?;
    println!("✓ {}", record);
    if !record.is_complete() {
        println!("! Invalid fields: {:?}", record.invalid_fields());
    }

    println!("{}", serde_json::to_string_pretty(&record.to_flat())?);
    if let Some(image) = session.last_image() {
        println!("{}", image);
    }

    session.end().await?;
    println!("✓ Done");

    Ok(())
}
