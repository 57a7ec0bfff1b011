//! The multipart frame container. A logical wire message is a sequence of
//! byte frames; the whole sequence travels as one length-delimited transport
//! unit.

use crate::error::{NetworkError, NetworkResult};
use bytes::Bytes;

/// A multipart frame sequence.
pub type Frames = Vec<Vec<u8>>;

/// Encode a frame sequence into one transport unit.
pub fn encode(frames: &Frames) -> Bytes {
    Bytes::from(bincode::serialize(frames).expect("Failed to serialize frames"))
}

/// Decode a transport unit back into its frame sequence.
pub fn decode(bytes: &[u8]) -> NetworkResult<Frames> {
    bincode::deserialize(bytes).map_err(|e| NetworkError::MalformedFrames(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frames = vec![b"identity".to_vec(), Vec::new(), b"{\"a\":1}".to_vec()];
        let encoded = encode(&frames);
        assert_eq!(decode(&encoded).unwrap(), frames);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode(&[0xff; 3]).is_err());
    }
}
