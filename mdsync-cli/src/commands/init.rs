//! Initialize the device data directory.

use anyhow::Result;
use mdsync_client::ClientConfig;
use std::path::Path;

use crate::config::{self, DATABASE_FILE};

/// Run the init command.
pub async fn run(data_dir: &Path, label: &str, platform: Option<&str>) -> Result<()> {
    if config::exists(data_dir) {
        anyhow::bail!(
            "Device already initialized. Delete {} to reinitialize.",
            config::config_path(data_dir).display()
        );
    }

    let mut client_config = ClientConfig::default();
    client_config.device.label = label.to_string();
    client_config.device.platform = platform.map(str::to_string);
    client_config.storage.database = data_dir.join(DATABASE_FILE);
    config::save(&client_config, data_dir).await?;

    println!("Device initialized successfully!");
    println!();
    println!("  Label:     {}", client_config.device.label);
    println!("  Database:  {}", client_config.storage.database.display());
    println!("  Data dir:  {}", data_dir.display());
    println!();
    println!("Next steps:");
    println!("  1. Replay reflected envelopes: mdsync replay --identity <ID> <file.json>");
    println!("  2. Inspect replay protection: mdsync status");

    Ok(())
}
