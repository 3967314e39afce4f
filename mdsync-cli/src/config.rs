//! Configuration management for the mdsync CLI.
//!
//! The data directory holds `mdsync.toml` and the SQLite database it names.

use anyhow::{Context, Result};
use mdsync_client::ClientConfig;
use std::path::{Path, PathBuf};

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "mdsync.toml";

/// Name of the database file created by `init`.
pub const DATABASE_FILE: &str = "mdsync.db";

/// Path of the configuration file for a data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Check if the data directory is initialized.
pub fn exists(data_dir: &Path) -> bool {
    config_path(data_dir).exists()
}

/// Load the configuration from a data directory.
pub fn load(data_dir: &Path) -> Result<ClientConfig> {
    let path = config_path(data_dir);
    if !path.exists() {
        anyhow::bail!("Device not initialized. Run 'mdsync init' first.");
    }
    ClientConfig::from_file(&path).context("Invalid configuration")
}

/// Save the configuration to a data directory.
pub async fn save(config: &ClientConfig, data_dir: &Path) -> Result<()> {
    let path = config_path(data_dir);
    let contents = config.to_toml().context("Failed to render configuration")?;
    tokio::fs::write(&path, contents)
        .await
        .context("Failed to save configuration")?;
    set_file_permissions_0600(&path).await?;
    Ok(())
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
pub async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
