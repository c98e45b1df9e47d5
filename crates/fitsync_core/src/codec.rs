//! CBOR helpers shared by the journal and the remote adapters.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes `value` as CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if serialization fails.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR value.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if `bytes` is not a valid encoding of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}
