//! Revision identifiers for the index store and their sortable byte form.
//!
//! A revision is a `(main, sub)` pair: `main` is bumped once per logical
//! operation batch, `sub` numbers the keys touched by that batch. The encoded
//! form is 17 bytes, `main` big-endian, a `_` separator, `sub` big-endian, so
//! byte order equals revision order for non-negative revisions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::{StorageError, StorageResult};

/// Length of an encoded revision.
pub const REVISION_BYTES_LEN: usize = 8 + 1 + 8;

const SEPARATOR: u8 = b'_';

/// A point in the index store's history.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Revision {
    /// Main revision number (global counter)
    pub main: i64,
    /// Sub-revision (operation index within a main revision)
    pub sub: i64,
}

impl Revision {
    pub fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }

    /// Encodes to the fixed-width sortable form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REVISION_BYTES_LEN);
        buf.extend_from_slice(&self.main.to_be_bytes());
        buf.push(SEPARATOR);
        buf.extend_from_slice(&self.sub.to_be_bytes());
        buf
    }

    /// Decodes bytes produced by [`Revision::encode`].
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != REVISION_BYTES_LEN {
            return Err(StorageError::InvalidFormat(format!(
                "revision must be {} bytes, got {}",
                REVISION_BYTES_LEN,
                bytes.len()
            )));
        }

        let mut main = [0u8; 8];
        main.copy_from_slice(&bytes[..8]);
        let mut sub = [0u8; 8];
        sub.copy_from_slice(&bytes[9..]);

        Ok(Self {
            main: i64::from_be_bytes(main),
            sub: i64::from_be_bytes(sub),
        })
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.main, self.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let bytes = Revision::new(1, 2).encode();
        assert_eq!(bytes.len(), REVISION_BYTES_LEN);
        assert_eq!(bytes[8], b'_');
        assert_eq!(&bytes[..8], &1i64.to_be_bytes());
        assert_eq!(&bytes[9..], &2i64.to_be_bytes());
    }

    #[test]
    fn test_roundtrip() {
        for rev in [Revision::new(0, 0), Revision::new(7, 3), Revision::new(i64::MAX, 12)] {
            assert_eq!(Revision::decode(&rev.encode()).unwrap(), rev);
        }
    }

    #[test]
    fn test_encoding_preserves_order() {
        let revs = [
            Revision::new(1, 0),
            Revision::new(1, 1),
            Revision::new(2, 0),
            Revision::new(255, 0),
            Revision::new(256, 0),
            Revision::new(256, 300),
        ];
        for pair in revs.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].encode() < pair[1].encode());
        }
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(matches!(
            Revision::decode(&[0u8; 16]),
            Err(StorageError::InvalidFormat(_))
        ));
        assert!(Revision::decode(&[]).is_err());
    }
}
