//! Binary envelope codec.
//!
//! Calls travel as `MsgPack` with named fields (`rmp_serde::to_vec_named()`),
//! so the envelope is self-describing and tolerant of added optional fields.

use crate::call::ServiceCall;

pub use rmp_serde::decode::Error as DecodeError;
pub use rmp_serde::encode::Error as EncodeError;

/// Serializes a call into its wire body.
///
/// # Errors
///
/// Returns an error if the call cannot be encoded (e.g., a params document
/// holding a value `MsgPack` cannot represent).
pub fn encode_call(call: &ServiceCall) -> Result<Vec<u8>, EncodeError> {
    rmp_serde::to_vec_named(call)
}

/// Reconstructs an independent call from a wire body.
///
/// # Errors
///
/// Returns an error if `bytes` is not a valid encoded `ServiceCall`.
pub fn decode_call(bytes: &[u8]) -> Result<ServiceCall, DecodeError> {
    rmp_serde::from_slice(bytes)
}
