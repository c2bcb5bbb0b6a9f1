//! MVCC key and value codec.
//!
//! Key layout: `memcomparable(user_key) ++ be(u64::MAX - ts)`.
//!
//! The user key is encoded in 8-byte groups, each followed by a marker byte
//! (`0xFF - padding`), which keeps byte order equal to user-key order even
//! when one key is a prefix of another. The complemented timestamp then sorts
//! a key's versions newest first, so "latest version <= ts" is a forward seek
//! to `encode_key(key, ts)`.
//!
//! Value layout: `flag(1) [ttl be i64 (8), only for PutTTL] payload`.

use crate::storage::{StorageError, StorageResult};

const GROUP_SIZE: usize = 8;
const MARKER: u8 = 0xFF;
const PAD: u8 = 0x00;
const TS_LEN: usize = 8;

/// Timestamp used to address "the newest version" of a key.
pub const MAX_TS: i64 = i64::MAX;

/// How a packaged value should be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueFlag {
    Put = 0,
    PutTtl = 1,
    Delete = 2,
}

impl ValueFlag {
    fn from_byte(b: u8) -> StorageResult<Self> {
        match b {
            0 => Ok(ValueFlag::Put),
            1 => Ok(ValueFlag::PutTtl),
            2 => Ok(ValueFlag::Delete),
            other => Err(StorageError::InvalidFormat(format!("unknown value flag {}", other))),
        }
    }
}

/// A decoded value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackagedValue {
    pub flag: ValueFlag,
    /// Absolute expiry in unix milliseconds, only for `PutTtl`.
    pub ttl: i64,
    pub payload: Vec<u8>,
}

impl PackagedValue {
    /// Whether a `PutTtl` value has expired at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.flag == ValueFlag::PutTtl && self.ttl > 0 && self.ttl <= now_ms
    }
}

/// Encodes a user key so that byte order matches key order.
pub fn encode_bytes(key: &[u8]) -> Vec<u8> {
    let groups = key.len() / GROUP_SIZE + 1;
    let mut out = Vec::with_capacity(groups * (GROUP_SIZE + 1));
    for chunk_start in (0..=key.len()).step_by(GROUP_SIZE) {
        let chunk_end = (chunk_start + GROUP_SIZE).min(key.len());
        let chunk = &key[chunk_start..chunk_end];
        let pad = GROUP_SIZE - chunk.len();
        out.extend_from_slice(chunk);
        out.extend(std::iter::repeat(PAD).take(pad));
        out.push(MARKER - pad as u8);
        if pad > 0 {
            break;
        }
    }
    out
}

/// Decodes a memcomparable user key, returning it and the bytes consumed.
pub fn decode_bytes(data: &[u8]) -> StorageResult<(Vec<u8>, usize)> {
    let mut key = Vec::new();
    let mut offset = 0;
    loop {
        if offset + GROUP_SIZE + 1 > data.len() {
            return Err(StorageError::InvalidFormat("truncated encoded key".to_string()));
        }
        let group = &data[offset..offset + GROUP_SIZE];
        let marker = data[offset + GROUP_SIZE];
        offset += GROUP_SIZE + 1;

        let pad = (MARKER - marker) as usize;
        if pad == 0 {
            key.extend_from_slice(group);
            continue;
        }
        if pad > GROUP_SIZE {
            return Err(StorageError::InvalidFormat(format!("bad group marker {:#x}", marker)));
        }
        let real = GROUP_SIZE - pad;
        if group[real..].iter().any(|b| *b != PAD) {
            return Err(StorageError::InvalidFormat("non-zero key padding".to_string()));
        }
        key.extend_from_slice(&group[..real]);
        return Ok((key, offset));
    }
}

/// Encodes `(key, ts)`; larger timestamps sort first.
pub fn encode_key(key: &[u8], ts: i64) -> Vec<u8> {
    let mut out = encode_bytes(key);
    out.extend_from_slice(&(u64::MAX - ts as u64).to_be_bytes());
    out
}

/// Splits an encoded key back into `(user_key, ts)`.
pub fn decode_key(encoded: &[u8]) -> StorageResult<(Vec<u8>, i64)> {
    let (key, used) = decode_bytes(encoded)?;
    if encoded.len() != used + TS_LEN {
        return Err(StorageError::InvalidFormat(format!(
            "encoded key has {} trailing bytes, want {}",
            encoded.len() - used,
            TS_LEN
        )));
    }
    let mut ts = [0u8; TS_LEN];
    ts.copy_from_slice(&encoded[used..]);
    Ok((key, (u64::MAX - u64::from_be_bytes(ts)) as i64))
}

/// First encoded key at or after every version of `key` (its newest slot).
pub fn key_lower_bound(key: &[u8]) -> Vec<u8> {
    encode_key(key, MAX_TS)
}

/// Packages a value with its flag and, for `PutTtl`, the expiry.
pub fn package_value(flag: ValueFlag, ttl: i64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + TS_LEN + payload.len());
    out.push(flag as u8);
    if flag == ValueFlag::PutTtl {
        out.extend_from_slice(&ttl.to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Inverse of [`package_value`].
pub fn unpackage_value(data: &[u8]) -> StorageResult<PackagedValue> {
    let (&flag_byte, rest) = data
        .split_first()
        .ok_or_else(|| StorageError::InvalidFormat("empty packaged value".to_string()))?;
    let flag = ValueFlag::from_byte(flag_byte)?;
    match flag {
        ValueFlag::PutTtl => {
            if rest.len() < TS_LEN {
                return Err(StorageError::InvalidFormat("truncated ttl".to_string()));
            }
            let mut ttl = [0u8; TS_LEN];
            ttl.copy_from_slice(&rest[..TS_LEN]);
            Ok(PackagedValue {
                flag,
                ttl: i64::from_be_bytes(ttl),
                payload: rest[TS_LEN..].to_vec(),
            })
        }
        _ => Ok(PackagedValue {
            flag,
            ttl: 0,
            payload: rest.to_vec(),
        }),
    }
}
