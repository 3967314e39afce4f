//! Show the confirmation short code for a rendezvous path hash.

use anyhow::{Context, Result};
use mdsync_core::linking::RPH_SIZE;
use mdsync_core::{RendezvousPathHash, ShortCode};

/// Parse a hex-encoded rendezvous path hash.
pub fn parse_rph(rph_hex: &str) -> Result<RendezvousPathHash> {
    let bytes = hex::decode(rph_hex.trim()).context("Rendezvous path hash must be hex")?;
    let bytes: [u8; RPH_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        anyhow::anyhow!(
            "Rendezvous path hash must be {} bytes, got {}",
            RPH_SIZE,
            bytes.len()
        )
    })?;
    Ok(RendezvousPathHash::from_bytes(bytes))
}

/// Compute the short code shown on both devices.
pub fn short_code(rph_hex: &str) -> Result<ShortCode> {
    Ok(parse_rph(rph_hex)?.short_code())
}

/// Run the short-code command.
pub fn run(rph_hex: &str) -> Result<()> {
    let code = short_code(rph_hex)?;
    println!("Short code: {}", code);
    println!();
    println!("Compare this with the code shown on the new device.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_code_reduces_prefix() {
        let rph = format!("0080ff{}", "00".repeat(29));
        assert_eq!(short_code(&rph).unwrap(), ShortCode(0, 0, 127));
    }

    #[test]
    fn short_code_rejects_wrong_length() {
        let err = short_code("0080ff").unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn short_code_rejects_non_hex() {
        assert!(short_code(&"zz".repeat(32)).is_err());
    }
}
