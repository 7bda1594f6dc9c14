//! Fixed-size binary form of a [`NormalizedEvent`].
//!
//! Agents that cannot afford JSON ship events to the collector as one binary
//! frame per event. The frame length is the record length; anything else is
//! not a record and is dropped by the receiver without partial parsing.
//!
//! Layout (little-endian, 3752 bytes):
//!
//! ```text
//!    0 u32  version (= 1)          56 i64  path_age
//!    4 i32  kind tag               64 i64  lifetime
//!    8 i64  ts                     72 i32  to_protect_pid
//!   16 i32  pid                    76 u32  padding
//!   20 i32  tid                    80 u16[260]  image_file
//!   24 i32  caller_pid            600 u16[1024] command_line
//!   28 i32  operation            2648 u16[260]  file_name
//!   32 i32  is_create (-1 = n/a) 3168 u16[260]  path
//!   36 i32  reserved             3688 u8[64]    path_hash (ASCII hex)
//!   40 u64  image_base
//!   48 u32  image_size
//!   52 u32  padding
//! ```

use thiserror::Error;

use crate::constants::{COMMAND_CAPACITY, PATH_CAPACITY};
use crate::cursor::{ByteCursor, ByteWriter, Truncated};
use crate::event::{EventKind, NormalizedEvent};

pub const RECORD_VERSION: u32 = 1;
pub const HASH_CAPACITY: usize = 64;
pub const RECORD_SIZE: usize = 80 + 3 * 2 * PATH_CAPACITY + 2 * COMMAND_CAPACITY + HASH_CAPACITY;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is {got} bytes, expected {}", RECORD_SIZE)]
    Length { got: usize },

    #[error("unsupported record version {0}")]
    Version(u32),

    #[error("unknown event kind tag {0}")]
    Kind(i32),

    #[error(transparent)]
    Truncated(#[from] Truncated),
}

pub fn encode_record(ev: &NormalizedEvent) -> Vec<u8> {
    let is_create = match ev.is_create {
        None => -1,
        Some(false) => 0,
        Some(true) => 1,
    };
    let mut w = ByteWriter::with_capacity(RECORD_SIZE);
    w.put_u32(RECORD_VERSION)
        .put_i32(ev.kind.tag())
        .put_i64(ev.timestamp)
        .put_i32(ev.process_id)
        .put_i32(ev.thread_id)
        .put_i32(ev.caller_pid)
        .put_i32(ev.operation)
        .put_i32(is_create)
        .put_i32(ev.reserved)
        .put_u64(ev.image_base)
        .put_u32(ev.image_size)
        .zeros(4)
        .put_i64(ev.path_age)
        .put_i64(ev.lifetime)
        .put_i32(ev.to_protected_pid)
        .zeros(4)
        .put_wide(&ev.image_file, PATH_CAPACITY)
        .put_wide(&ev.command, COMMAND_CAPACITY)
        .put_wide(&ev.file_name, PATH_CAPACITY)
        .put_wide(&ev.path, PATH_CAPACITY)
        .put_ascii(&ev.path_hash, HASH_CAPACITY);
    debug_assert_eq!(w.len(), RECORD_SIZE);
    w.into_inner()
}

pub fn decode_record(bytes: &[u8]) -> Result<NormalizedEvent, RecordError> {
    if bytes.len() != RECORD_SIZE {
        return Err(RecordError::Length { got: bytes.len() });
    }
    let mut c = ByteCursor::new(bytes);

    let version = c.read_u32()?;
    if version != RECORD_VERSION {
        return Err(RecordError::Version(version));
    }
    let tag = c.read_i32()?;
    let kind = EventKind::from_tag(tag).ok_or(RecordError::Kind(tag))?;

    let timestamp = c.read_i64()?;
    let process_id = c.read_i32()?;
    let thread_id = c.read_i32()?;
    let caller_pid = c.read_i32()?;
    let operation = c.read_i32()?;
    let is_create = match c.read_i32()? {
        -1 => None,
        0 => Some(false),
        _ => Some(true),
    };
    let reserved = c.read_i32()?;
    let image_base = c.read_u64()?;
    let image_size = c.read_u32()?;
    c.skip(4)?;
    let path_age = c.read_i64()?;
    let lifetime = c.read_i64()?;
    let to_protected_pid = c.read_i32()?;
    c.skip(4)?;

    Ok(NormalizedEvent {
        kind,
        timestamp,
        process_id,
        thread_id,
        caller_pid,
        operation,
        is_create,
        image_file: c.read_wide(PATH_CAPACITY)?,
        command: c.read_wide(COMMAND_CAPACITY)?,
        file_name: c.read_wide(PATH_CAPACITY)?,
        image_base,
        image_size,
        path: c.read_wide(PATH_CAPACITY)?,
        path_age,
        path_hash: c.read_ascii(HASH_CAPACITY)?,
        lifetime,
        to_protected_pid,
        reserved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> NormalizedEvent {
        NormalizedEvent {
            kind: EventKind::ImageLoad,
            timestamp: 1_700_000_123_456_789_000,
            process_id: 100,
            thread_id: 0,
            caller_pid: 100,
            operation: 0,
            is_create: None,
            image_file: r"\Windows\System32\kernel32.dll".into(),
            command: String::new(),
            file_name: String::new(),
            image_base: 0x7ff8_0000_0000,
            image_size: 0x000c_2000,
            path: r"C:\Program Files\Game\game.exe".into(),
            path_age: 86_400,
            path_hash: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".into(),
            lifetime: 420,
            to_protected_pid: 100,
            reserved: 4,
        }
    }

    #[test]
    fn record_size_is_fixed() {
        assert_eq!(RECORD_SIZE, 3752);
        assert_eq!(encode_record(&populated()).len(), RECORD_SIZE);
    }

    #[test]
    fn round_trip_is_field_for_field() {
        let ev = populated();
        assert_eq!(decode_record(&encode_record(&ev)).unwrap(), ev);

        let mut thread = NormalizedEvent::new(EventKind::ThreadCreate);
        thread.process_id = 100;
        thread.thread_id = 5;
        thread.caller_pid = 200;
        thread.is_create = Some(false);
        thread.command = "x".repeat(COMMAND_CAPACITY);
        assert_eq!(decode_record(&encode_record(&thread)).unwrap(), thread);
    }

    #[test]
    fn off_by_one_lengths_are_rejected() {
        let mut bytes = encode_record(&populated());
        bytes.push(0);
        assert_eq!(decode_record(&bytes), Err(RecordError::Length { got: RECORD_SIZE + 1 }));
        bytes.truncate(RECORD_SIZE - 1);
        assert_eq!(decode_record(&bytes), Err(RecordError::Length { got: RECORD_SIZE - 1 }));
    }

    #[test]
    fn wrong_version_or_kind_is_rejected() {
        let mut bytes = encode_record(&populated());
        bytes[0..4].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(decode_record(&bytes), Err(RecordError::Version(2)));

        let mut bytes = encode_record(&populated());
        bytes[4..8].copy_from_slice(&11i32.to_le_bytes());
        assert_eq!(decode_record(&bytes), Err(RecordError::Kind(11)));
    }
}
