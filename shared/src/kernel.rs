//! Minifilter port frames.
//!
//! Every message the driver sends is a `FILTER_MESSAGE_HEADER` followed by one
//! of five fixed-layout C structs. The first `int` of each struct is the
//! discriminant:
//!
//! | tag | variant         | size (64-bit) | size (32-bit) |
//! |-----|-----------------|---------------|---------------|
//! | 0   | `ProcessCreate` | 2580          | 2580          |
//! | 1   | `FilePreOp`     | 532           | 532           |
//! | 2   | `ObjectOp`      | 16            | 16            |
//! | 3   | `ThreadCreate`  | 20            | 20            |
//! | 4   | `ImageLoad`     | 544           | 536           |
//!
//! Receive buffers are sized for the largest variant; the decoder only ever
//! looks at the bytes of the variant the tag selects.

use thiserror::Error;

use crate::constants::{COMMAND_CAPACITY, PATH_CAPACITY};
use crate::cursor::{ByteCursor, ByteWriter, Truncated, WordWidth};

/// `FILTER_MESSAGE_HEADER`: `ULONG ReplyLength`, 4 bytes padding, `ULONGLONG MessageId`.
pub const HEADER_SIZE: usize = 16;

pub const TAG_PROCESS_CREATE: i32 = 0;
pub const TAG_FILE_PRE_OP: i32 = 1;
pub const TAG_OBJECT_OP: i32 = 2;
pub const TAG_THREAD_CREATE: i32 = 3;
pub const TAG_IMAGE_LOAD: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub reply_length: u32,
    pub message_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCreate {
    pub is_create: bool,
    pub pid: i32,
    pub image_file: String,
    pub command_line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePreOp {
    /// IRP major function (`IRP_MJ_CREATE = 0`, `IRP_MJ_READ = 3`, ...).
    pub operation: i32,
    pub pid: i32,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectOp {
    /// 0 = handle create, 1 = handle duplicate.
    pub operation: i32,
    pub pid: i32,
    pub caller_pid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadCreate {
    pub is_create: bool,
    pub pid: i32,
    pub tid: i32,
    pub caller_pid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLoad {
    pub pid: i32,
    pub image_file: String,
    pub image_base: u64,
    pub image_size: u32,
}

/// One decoded driver message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventVariant {
    ProcessCreate(ProcessCreate),
    FilePreOp(FilePreOp),
    ObjectOp(ObjectOp),
    ThreadCreate(ThreadCreate),
    ImageLoad(ImageLoad),
}

impl EventVariant {
    pub fn tag(&self) -> i32 {
        match self {
            EventVariant::ProcessCreate(_) => TAG_PROCESS_CREATE,
            EventVariant::FilePreOp(_) => TAG_FILE_PRE_OP,
            EventVariant::ObjectOp(_) => TAG_OBJECT_OP,
            EventVariant::ThreadCreate(_) => TAG_THREAD_CREATE,
            EventVariant::ImageLoad(_) => TAG_IMAGE_LOAD,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown event tag {tag} (message id {message_id})")]
    UnknownTag { tag: i32, message_id: u64 },

    #[error(transparent)]
    Truncated(#[from] Truncated),

    #[error("variant {tag} consumed {consumed} bytes, layout declares {declared}")]
    SizeMismatch { tag: i32, consumed: usize, declared: usize },
}

/// Sizes of the driver structs for a given word width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: WordWidth,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::native()
    }
}

impl FrameLayout {
    pub const fn native() -> Self {
        Self { width: WordWidth::native() }
    }

    pub const fn new(width: WordWidth) -> Self {
        Self { width }
    }

    /// Declared size of the struct selected by `tag`.
    pub const fn variant_size(&self, tag: i32) -> Option<usize> {
        match tag {
            TAG_PROCESS_CREATE => Some(12 + 2 * PATH_CAPACITY + 2 * COMMAND_CAPACITY),
            TAG_FILE_PRE_OP => Some(12 + 2 * PATH_CAPACITY),
            TAG_OBJECT_OP => Some(16),
            TAG_THREAD_CREATE => Some(20),
            TAG_IMAGE_LOAD => Some(self.image_load_size()),
            _ => None,
        }
    }

    /// `{int, int, wchar_t[260], PVOID, ULONG}` with natural alignment.
    const fn image_load_size(&self) -> usize {
        let base_at = 8 + 2 * PATH_CAPACITY; // 528, already 8-aligned
        let size_at = base_at + self.width.bytes();
        let end = size_at + 4;
        let align = self.width.bytes();
        end.div_ceil(align) * align
    }

    pub const fn max_variant_size(&self) -> usize {
        let mut max = 0;
        let mut tag = TAG_PROCESS_CREATE;
        while tag <= TAG_IMAGE_LOAD {
            if let Some(size) = self.variant_size(tag) {
                if size > max {
                    max = size;
                }
            }
            tag += 1;
        }
        max
    }

    /// Size of one receive buffer: header plus the largest variant.
    pub const fn frame_size(&self) -> usize {
        HEADER_SIZE + self.max_variant_size()
    }
}

pub fn decode_header(frame: &[u8]) -> Result<MessageHeader, Truncated> {
    let mut c = ByteCursor::new(frame);
    let reply_length = c.read_u32()?;
    c.skip(4)?;
    let message_id = c.read_u64()?;
    Ok(MessageHeader { reply_length, message_id })
}

/// Decode a full receive buffer (header + payload).
pub fn decode_frame(
    frame: &[u8],
    layout: FrameLayout,
) -> Result<(MessageHeader, EventVariant), DecodeError> {
    let header = decode_header(frame)?;
    let variant = decode_payload(&frame[HEADER_SIZE..], header.message_id, layout)?;
    Ok((header, variant))
}

/// Decode the payload part of a frame; `message_id` is only used for errors.
pub fn decode_payload(
    payload: &[u8],
    message_id: u64,
    layout: FrameLayout,
) -> Result<EventVariant, DecodeError> {
    let tag = ByteCursor::new(payload).read_i32()?;
    let declared = layout
        .variant_size(tag)
        .ok_or(DecodeError::UnknownTag { tag, message_id })?;

    // Restrict the cursor to the declared struct: tail bytes of the pooled
    // buffer belong to whatever message used it before.
    let mut c = ByteCursor::new(payload);
    let body = c.take(declared)?;
    let mut c = ByteCursor::new(body);
    c.skip(4)?;

    let variant = match tag {
        TAG_PROCESS_CREATE => {
            let is_create = c.read_i32()? != 0;
            let pid = c.read_i32()?;
            let image_file = c.read_wide(PATH_CAPACITY)?;
            let command_line = c.read_wide(COMMAND_CAPACITY)?;
            EventVariant::ProcessCreate(ProcessCreate { is_create, pid, image_file, command_line })
        }
        TAG_FILE_PRE_OP => {
            let operation = c.read_i32()?;
            let pid = c.read_i32()?;
            let file_name = c.read_wide(PATH_CAPACITY)?;
            EventVariant::FilePreOp(FilePreOp { operation, pid, file_name })
        }
        TAG_OBJECT_OP => {
            let operation = c.read_i32()?;
            let pid = c.read_i32()?;
            let caller_pid = c.read_i32()?;
            EventVariant::ObjectOp(ObjectOp { operation, pid, caller_pid })
        }
        TAG_THREAD_CREATE => {
            let is_create = c.read_i32()? != 0;
            let pid = c.read_i32()?;
            let tid = c.read_i32()?;
            let caller_pid = c.read_i32()?;
            EventVariant::ThreadCreate(ThreadCreate { is_create, pid, tid, caller_pid })
        }
        TAG_IMAGE_LOAD => {
            let pid = c.read_i32()?;
            let image_file = c.read_wide(PATH_CAPACITY)?;
            let image_base = c.read_word(layout.width)?;
            let image_size = c.read_u32()?;
            // trailing alignment padding
            c.skip(c.remaining())?;
            EventVariant::ImageLoad(ImageLoad { pid, image_file, image_base, image_size })
        }
        _ => return Err(DecodeError::UnknownTag { tag, message_id }),
    };

    if c.position() != declared {
        return Err(DecodeError::SizeMismatch { tag, consumed: c.position(), declared });
    }
    Ok(variant)
}

/// Lay a variant out exactly as the driver would (no header).
pub fn encode_variant(variant: &EventVariant, layout: FrameLayout) -> Vec<u8> {
    let tag = variant.tag();
    let declared = layout.variant_size(tag).unwrap_or_default();
    let mut w = ByteWriter::with_capacity(declared);
    w.put_i32(tag);
    match variant {
        EventVariant::ProcessCreate(p) => {
            w.put_i32(p.is_create as i32)
                .put_i32(p.pid)
                .put_wide(&p.image_file, PATH_CAPACITY)
                .put_wide(&p.command_line, COMMAND_CAPACITY);
        }
        EventVariant::FilePreOp(f) => {
            w.put_i32(f.operation).put_i32(f.pid).put_wide(&f.file_name, PATH_CAPACITY);
        }
        EventVariant::ObjectOp(o) => {
            w.put_i32(o.operation).put_i32(o.pid).put_i32(o.caller_pid);
        }
        EventVariant::ThreadCreate(t) => {
            w.put_i32(t.is_create as i32).put_i32(t.pid).put_i32(t.tid).put_i32(t.caller_pid);
        }
        EventVariant::ImageLoad(i) => {
            w.put_i32(i.pid)
                .put_wide(&i.image_file, PATH_CAPACITY)
                .put_word(i.image_base, layout.width)
                .put_u32(i.image_size);
        }
    }
    let pad = declared.saturating_sub(w.len());
    w.zeros(pad);
    w.into_inner()
}

/// Build a full receive buffer (`layout.frame_size()` bytes) for `variant`.
pub fn encode_frame(header: MessageHeader, variant: &EventVariant, layout: FrameLayout) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(layout.frame_size());
    w.put_u32(header.reply_length).zeros(4).put_u64(header.message_id);
    let mut out = w.into_inner();
    out.extend_from_slice(&encode_variant(variant, layout));
    out.resize(layout.frame_size(), 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const L64: FrameLayout = FrameLayout::new(WordWidth::Bits64);
    const L32: FrameLayout = FrameLayout::new(WordWidth::Bits32);

    fn header(id: u64) -> MessageHeader {
        MessageHeader { reply_length: 0, message_id: id }
    }

    fn samples() -> Vec<EventVariant> {
        vec![
            EventVariant::ProcessCreate(ProcessCreate {
                is_create: true,
                pid: 4242,
                image_file: r"\Device\HarddiskVolume3\Windows\System32\cmd.exe".into(),
                command_line: r#"cmd.exe /c "whoami /all""#.into(),
            }),
            EventVariant::FilePreOp(FilePreOp {
                operation: 4,
                pid: 77,
                file_name: r"\Users\bob\Documents\report.docx".into(),
            }),
            EventVariant::ObjectOp(ObjectOp { operation: 1, pid: 100, caller_pid: 666 }),
            EventVariant::ThreadCreate(ThreadCreate { is_create: true, pid: 100, tid: 9000, caller_pid: 200 }),
            EventVariant::ImageLoad(ImageLoad {
                pid: 100,
                image_file: r"\Windows\System32\ntdll.dll".into(),
                image_base: 0x7ffa_1234_0000,
                image_size: 0x1f_0000,
            }),
        ]
    }

    #[test]
    fn layout_sizes_match_driver_structs() {
        assert_eq!(L64.variant_size(TAG_PROCESS_CREATE), Some(2580));
        assert_eq!(L64.variant_size(TAG_FILE_PRE_OP), Some(532));
        assert_eq!(L64.variant_size(TAG_OBJECT_OP), Some(16));
        assert_eq!(L64.variant_size(TAG_THREAD_CREATE), Some(20));
        assert_eq!(L64.variant_size(TAG_IMAGE_LOAD), Some(544));
        assert_eq!(L32.variant_size(TAG_IMAGE_LOAD), Some(536));
        assert_eq!(L64.max_variant_size(), 2580);
        assert_eq!(L64.frame_size(), HEADER_SIZE + 2580);
        assert_eq!(L64.variant_size(9), None);
    }

    #[test]
    fn every_known_tag_decodes_field_for_field() {
        for layout in [L64, L32] {
            for (id, variant) in samples().into_iter().enumerate() {
                let frame = encode_frame(header(id as u64), &variant, layout);
                assert_eq!(frame.len(), layout.frame_size());
                let (hdr, decoded) = decode_frame(&frame, layout).unwrap();
                assert_eq!(hdr.message_id, id as u64);
                assert_eq!(decoded, variant);
            }
        }
    }

    #[test]
    fn image_base_is_read_at_the_aligned_offset() {
        let variant = EventVariant::ImageLoad(ImageLoad {
            pid: 1,
            image_file: String::new(),
            image_base: 0x1122_3344_5566_7788,
            image_size: 0xaabb_ccdd,
        });
        let bytes = encode_variant(&variant, L64);
        assert_eq!(&bytes[528..536], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[536..540], &0xaabb_ccddu32.to_le_bytes());
        assert_eq!(bytes.len(), 544);

        let bytes = encode_variant(&variant, L32);
        assert_eq!(&bytes[528..532], &0x5566_7788u32.to_le_bytes());
        assert_eq!(&bytes[532..536], &0xaabb_ccddu32.to_le_bytes());
    }

    #[test]
    fn unknown_tag_is_rejected_and_buffer_untouched() {
        let mut frame = encode_frame(header(31337), &samples()[2], L64);
        frame[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&7i32.to_le_bytes());
        let before = frame.clone();

        let err = decode_frame(&frame, L64).unwrap_err();
        assert_eq!(err, DecodeError::UnknownTag { tag: 7, message_id: 31337 });
        assert_eq!(frame, before);
    }

    #[test]
    fn tail_bytes_past_the_variant_are_ignored() {
        let mut frame = encode_frame(header(1), &samples()[3], L64);
        // stale data left by a previous, larger message
        for b in &mut frame[HEADER_SIZE + 20..] {
            *b = 0xcc;
        }
        let (_, decoded) = decode_frame(&frame, L64).unwrap();
        assert_eq!(decoded, samples()[3]);
    }

    #[test]
    fn short_payload_is_truncated_not_panicking() {
        let frame = encode_frame(header(5), &samples()[0], L64);
        let err = decode_frame(&frame[..HEADER_SIZE + 100], L64).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated(_)));

        let err = decode_frame(&frame[..10], L64).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated(_)));
    }
}
