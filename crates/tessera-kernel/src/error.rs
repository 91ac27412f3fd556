//! Kernel error types.

use thiserror::Error;

/// Errors raised while encoding, decoding or restoring kernel state.
///
/// Command-level failures (a missing node, an unknown message id) are not
/// kernel errors: they are part of the reply and travel back to the client.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[source] postcard::Error),

    /// A value could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[source] postcard::Error),
}
