//! Postcard encoding helpers.
//!
//! Commands, replies and snapshots cross the consensus layer as opaque bytes.
//! Both sides of that boundary go through these two functions so the wire
//! format stays in one place.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::KernelError;

/// Encodes a value into a postcard byte buffer.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, KernelError> {
    postcard::to_allocvec(value)
        .map(Bytes::from)
        .map_err(KernelError::Encode)
}

/// Decodes a postcard byte buffer.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, KernelError> {
    postcard::from_bytes(bytes).map_err(KernelError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TreeCommand;

    #[test]
    fn decode_rejects_garbage() {
        let result: Result<TreeCommand, _> = decode(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(KernelError::Decode(_))));
    }

    #[test]
    fn command_survives_encoding() {
        let cmd = TreeCommand::Create {
            path: "/dev/null".into(),
            value: "empty".into(),
        };
        let bytes = encode(&cmd).expect("encode");
        let decoded: TreeCommand = decode(&bytes).expect("decode");
        assert_eq!(decoded, cmd);
    }
}
