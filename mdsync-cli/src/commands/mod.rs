//! CLI command implementations.

pub mod init;
pub mod replay;
pub mod short_code;
pub mod status;
