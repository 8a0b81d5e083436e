//! Key encoding for RocksDB column families.
//!
//! All numeric values use big-endian encoding for correct lexicographic ordering.
//! Composite keys use `:` (0x3A) as separator.
//! Variable-length strings are length-prefixed with a big-endian u16.

use uuid::Uuid;

const SEPARATOR: u8 = b':';

/// Encode a u64 as 8 big-endian bytes.
fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Encode a variable-length string with a 2-byte big-endian length prefix.
/// Queue names are validated to at most 255 bytes before they reach here.
fn encode_string(s: &str) -> Vec<u8> {
    let len = s.len().min(u16::MAX as usize) as u16;
    let mut buf = Vec::with_capacity(2 + s.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len as usize]);
    buf
}

/// Message records are keyed by the raw 16 UUID bytes.
pub fn message_key(msg_id: &Uuid) -> Vec<u8> {
    msg_id.as_bytes().to_vec()
}

/// Prefix shared by every index entry of one queue.
pub fn queue_prefix(queue: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(32);
    prefix.extend_from_slice(&encode_string(queue));
    prefix.push(SEPARATOR);
    prefix
}

/// Build a pending index key: `{queue}:{255 - score}:{created_at_ns}:{msg_id}`
///
/// The inverted score makes the highest priority sort first; within one
/// priority, older messages sort first (UUIDv7 breaks exact timestamp ties).
pub fn pending_key(queue: &str, priority_score: u8, created_at_ns: u64, msg_id: &Uuid) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    key.push(u8::MAX - priority_score);
    key.push(SEPARATOR);
    key.extend_from_slice(&encode_u64(created_at_ns));
    key.push(SEPARATOR);
    key.extend_from_slice(msg_id.as_bytes());
    key
}

/// Build a time-ordered index key: `{queue}:{ts_ns}:{msg_id}`.
/// Used by the `processing` (receipt time) and `retry` (due time) indexes.
pub fn timed_key(queue: &str, ts_ns: u64, msg_id: &Uuid) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    key.extend_from_slice(&encode_u64(ts_ns));
    key.push(SEPARATOR);
    key.extend_from_slice(msg_id.as_bytes());
    key
}

/// Inclusive upper bound for scanning time-ordered keys of `queue` up to `ts_ns`.
pub fn timed_upper_bound(queue: &str, ts_ns: u64) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    key.extend_from_slice(&encode_u64(ts_ns));
    key.extend_from_slice(&[0xFF; 17]);
    key
}

/// Every index key ends with the 16 raw UUID bytes of the message.
pub fn parse_msg_id(key: &[u8]) -> Option<Uuid> {
    if key.len() < 16 {
        return None;
    }
    let bytes: [u8; 16] = key[key.len() - 16..].try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

pub fn execution_key(execution_id: &Uuid) -> Vec<u8> {
    execution_id.as_bytes().to_vec()
}
