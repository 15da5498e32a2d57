// src/server/handlers/mod.rs
//! Operation handlers, grouped by concern
//!
//! Each module exposes `operations()`, the registry entries it contributes.
//! Binary payloads cross the call surface as base64 strings.

pub mod admin;
pub mod changeset;
pub mod commit;
pub mod mirror;
pub mod query;

use crate::error::{Error, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

pub(crate) fn encode_bytes(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub(crate) fn decode_bytes(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| Error::InvalidRequest(format!("invalid base64 payload: {e}")))
}
