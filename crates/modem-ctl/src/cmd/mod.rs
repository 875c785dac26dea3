//! CLI command modules.

pub mod encode;
pub mod http;
pub mod keys;
pub mod messages;
pub mod status;
