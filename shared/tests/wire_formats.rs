// tests/wire_formats.rs

use shared::{
    event::{EventKind, NormalizedEvent},
    kernel::{
        EventVariant, FrameLayout, ImageLoad, MessageHeader, ObjectOp, ProcessCreate, ThreadCreate,
        decode_frame, encode_frame,
    },
    record::{RECORD_SIZE, RecordError, decode_record, encode_record},
};

fn header(id: u64) -> MessageHeader {
    MessageHeader { reply_length: 0, message_id: id }
}

fn normalize(variant: EventVariant) -> NormalizedEvent {
    let layout = FrameLayout::native();
    let frame = encode_frame(header(7), &variant, layout);
    assert_eq!(frame.len(), layout.frame_size());
    let (hdr, decoded) = decode_frame(&frame, layout).expect("decode");
    assert_eq!(hdr.message_id, 7);
    assert_eq!(decoded, variant);
    NormalizedEvent::from(decoded)
}

#[test]
fn driver_frames_normalize_with_the_right_caller() {
    let ev = normalize(EventVariant::ProcessCreate(ProcessCreate {
        is_create: true,
        pid: 4242,
        image_file: r"\Windows\System32\cmd.exe".into(),
        command_line: "cmd.exe /c ver".into(),
    }));
    assert_eq!(ev.kind, EventKind::ProcessCreate);
    assert_eq!(ev.caller_pid, 4242);
    assert_eq!(ev.is_create, Some(true));
    assert_eq!(ev.command, "cmd.exe /c ver");
    assert_eq!(ev.reserved, EventKind::ProcessCreate.tag());

    let ev = normalize(EventVariant::ThreadCreate(ThreadCreate {
        is_create: true,
        pid: 100,
        tid: 9,
        caller_pid: 200,
    }));
    assert_eq!((ev.process_id, ev.caller_pid, ev.thread_id), (100, 200, 9));

    let ev = normalize(EventVariant::ObjectOp(ObjectOp { operation: 2, pid: 100, caller_pid: 31 }));
    assert_eq!(ev.caller_pid, 31);
    assert_eq!(ev.is_create, None);

    let ev = normalize(EventVariant::ImageLoad(ImageLoad {
        pid: 100,
        image_file: r"\Windows\System32\ntdll.dll".into(),
        image_base: 0x7ff0_0000,
        image_size: 4096,
    }));
    assert_eq!(ev.caller_pid, 100);
    assert_eq!(ev.image_base, 0x7ff0_0000);
}

#[test]
fn enriched_event_survives_record_and_json() {
    let mut ev = normalize(EventVariant::ThreadCreate(ThreadCreate {
        is_create: true,
        pid: 100,
        tid: 9,
        caller_pid: 200,
    }));
    ev.timestamp = 1_700_000_000_123_456_789;
    ev.path = r"C:\Tools\injector.exe".into();
    ev.path_hash = "ab".repeat(32);
    ev.path_age = 3600;
    ev.lifetime = 12;
    ev.to_protected_pid = 100;

    let bytes = encode_record(&ev);
    assert_eq!(bytes.len(), RECORD_SIZE);
    assert_eq!(decode_record(&bytes).unwrap(), ev);

    let json = ev.to_json().unwrap();
    assert_eq!(NormalizedEvent::from_json(&json).unwrap(), ev);
}

#[test]
fn off_by_one_record_is_rejected() {
    let bytes = encode_record(&NormalizedEvent::new(EventKind::ObjectOp));
    for len in [RECORD_SIZE - 1, RECORD_SIZE + 1] {
        let mut b = bytes.clone();
        b.resize(len, 0);
        assert!(matches!(decode_record(&b), Err(RecordError::Length { got }) if got == len));
    }
}
