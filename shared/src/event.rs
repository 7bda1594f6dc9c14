//! Normalized event model.
//!
//! Every driver variant is flattened into one [`NormalizedEvent`]. That is the
//! shape detectors consume, the agent ships to the collector, and the
//! collector accepts back from either wire form (JSON or fixed record).
//!
//! JSON keys are stable; everything except `type` is omitted when empty and
//! optional when parsing.

use serde::{Deserialize, Serialize};

use crate::kernel::{
    EventVariant, TAG_FILE_PRE_OP, TAG_IMAGE_LOAD, TAG_OBJECT_OP, TAG_PROCESS_CREATE,
    TAG_THREAD_CREATE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "create_process")]
    ProcessCreate,
    #[serde(rename = "flt_preop")]
    FilePreOp,
    #[serde(rename = "ob_operation")]
    ObjectOp,
    #[serde(rename = "create_thread")]
    ThreadCreate,
    #[serde(rename = "load_image")]
    ImageLoad,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ProcessCreate => "create_process",
            EventKind::FilePreOp => "flt_preop",
            EventKind::ObjectOp => "ob_operation",
            EventKind::ThreadCreate => "create_thread",
            EventKind::ImageLoad => "load_image",
        }
    }

    /// Driver discriminant for this kind.
    pub fn tag(self) -> i32 {
        match self {
            EventKind::ProcessCreate => TAG_PROCESS_CREATE,
            EventKind::FilePreOp => TAG_FILE_PRE_OP,
            EventKind::ObjectOp => TAG_OBJECT_OP,
            EventKind::ThreadCreate => TAG_THREAD_CREATE,
            EventKind::ImageLoad => TAG_IMAGE_LOAD,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            TAG_PROCESS_CREATE => Some(EventKind::ProcessCreate),
            TAG_FILE_PRE_OP => Some(EventKind::FilePreOp),
            TAG_OBJECT_OP => Some(EventKind::ObjectOp),
            TAG_THREAD_CREATE => Some(EventKind::ThreadCreate),
            TAG_IMAGE_LOAD => Some(EventKind::ImageLoad),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_default<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Unix time in nanoseconds, stamped at enrichment.
    #[serde(rename = "ts", default, skip_serializing_if = "is_default")]
    pub timestamp: i64,

    #[serde(rename = "pid", default, skip_serializing_if = "is_default")]
    pub process_id: i32,
    #[serde(rename = "tid", default, skip_serializing_if = "is_default")]
    pub thread_id: i32,
    #[serde(default, skip_serializing_if = "is_default")]
    pub caller_pid: i32,
    #[serde(default, skip_serializing_if = "is_default")]
    pub operation: i32,
    /// Only process and thread notifications have a create/exit notion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_create: Option<bool>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_file: String,
    #[serde(rename = "command_line", default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,

    #[serde(default, skip_serializing_if = "is_default")]
    pub image_base: u64,
    #[serde(default, skip_serializing_if = "is_default")]
    pub image_size: u32,

    /// Executable of `caller_pid`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Seconds since `path` was created.
    #[serde(default, skip_serializing_if = "is_default")]
    pub path_age: i64,
    /// Hex digest of the file at `path`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_hash: String,
    /// Seconds since `caller_pid` started.
    #[serde(default, skip_serializing_if = "is_default")]
    pub lifetime: i64,
    #[serde(rename = "to_protect_pid", default, skip_serializing_if = "is_default")]
    pub to_protected_pid: i32,

    /// Driver discriminant the event was decoded from.
    #[serde(default, skip_serializing_if = "is_default")]
    pub reserved: i32,
}

impl NormalizedEvent {
    /// Empty event of the given kind.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: 0,
            process_id: 0,
            thread_id: 0,
            caller_pid: 0,
            operation: 0,
            is_create: None,
            image_file: String::new(),
            command: String::new(),
            file_name: String::new(),
            image_base: 0,
            image_size: 0,
            path: String::new(),
            path_age: 0,
            path_hash: String::new(),
            lifetime: 0,
            to_protected_pid: 0,
            reserved: kind.tag(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// True when the event concerns the protected process.
    pub fn targets_protected(&self) -> bool {
        self.to_protected_pid != 0 && self.process_id == self.to_protected_pid
    }
}

/// Flatten a driver variant. Process, file and image notifications are
/// attributed to the process they describe; object and thread notifications
/// carry their own caller.
impl From<EventVariant> for NormalizedEvent {
    fn from(variant: EventVariant) -> Self {
        match variant {
            EventVariant::ProcessCreate(p) => NormalizedEvent {
                process_id: p.pid,
                caller_pid: p.pid,
                is_create: Some(p.is_create),
                image_file: p.image_file,
                command: p.command_line,
                ..NormalizedEvent::new(EventKind::ProcessCreate)
            },
            EventVariant::FilePreOp(f) => NormalizedEvent {
                process_id: f.pid,
                caller_pid: f.pid,
                operation: f.operation,
                file_name: f.file_name,
                ..NormalizedEvent::new(EventKind::FilePreOp)
            },
            EventVariant::ObjectOp(o) => NormalizedEvent {
                process_id: o.pid,
                caller_pid: o.caller_pid,
                operation: o.operation,
                ..NormalizedEvent::new(EventKind::ObjectOp)
            },
            EventVariant::ThreadCreate(t) => NormalizedEvent {
                process_id: t.pid,
                thread_id: t.tid,
                caller_pid: t.caller_pid,
                is_create: Some(t.is_create),
                ..NormalizedEvent::new(EventKind::ThreadCreate)
            },
            EventVariant::ImageLoad(i) => NormalizedEvent {
                process_id: i.pid,
                caller_pid: i.pid,
                image_file: i.image_file,
                image_base: i.image_base,
                image_size: i.image_size,
                ..NormalizedEvent::new(EventKind::ImageLoad)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ObjectOp, ThreadCreate};
    use serde_json::Value;

    #[test]
    fn thread_variant_keeps_its_caller() {
        let ev = NormalizedEvent::from(EventVariant::ThreadCreate(ThreadCreate {
            is_create: true,
            pid: 100,
            tid: 7,
            caller_pid: 200,
        }));
        assert_eq!(ev.kind, EventKind::ThreadCreate);
        assert_eq!((ev.process_id, ev.thread_id, ev.caller_pid), (100, 7, 200));
        assert_eq!(ev.is_create, Some(true));
        assert_eq!(ev.reserved, TAG_THREAD_CREATE);
    }

    #[test]
    fn object_op_has_no_create_flag() {
        let ev = NormalizedEvent::from(EventVariant::ObjectOp(ObjectOp {
            operation: 1,
            pid: 100,
            caller_pid: 300,
        }));
        assert_eq!(ev.is_create, None);
        let json: Value = serde_json::from_slice(&ev.to_json().unwrap()).unwrap();
        assert!(json.get("is_create").is_none());
        assert_eq!(json["type"], "ob_operation");
        assert_eq!(json["caller_pid"], 300);
    }

    #[test]
    fn empty_fields_are_omitted() {
        let ev = NormalizedEvent::new(EventKind::ImageLoad);
        let json: Value = serde_json::from_slice(&ev.to_json().unwrap()).unwrap();
        let obj = json.as_object().unwrap();
        // `reserved` carries the tag (4) so it is the only other key
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(keys, vec!["reserved", "type"]);
    }

    #[test]
    fn parses_sparse_json_and_requires_type() {
        let ev = NormalizedEvent::from_json(br#"{"type":"create_thread","pid":5,"caller_pid":6}"#).unwrap();
        assert_eq!(ev.kind, EventKind::ThreadCreate);
        assert_eq!(ev.process_id, 5);
        assert_eq!(ev.caller_pid, 6);
        assert_eq!(ev.path, "");

        assert!(NormalizedEvent::from_json(br#"{"pid":5}"#).is_err());
        assert!(NormalizedEvent::from_json(br#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn json_round_trip_keeps_enrichment() {
        let mut ev = NormalizedEvent::new(EventKind::ObjectOp);
        ev.process_id = 100;
        ev.caller_pid = 42;
        ev.path = r"C:\tools\probe.exe".into();
        ev.path_hash = "ab".repeat(32);
        ev.path_age = 3600;
        ev.lifetime = 12;
        ev.to_protected_pid = 100;
        ev.timestamp = 1_700_000_000_000_000_000;

        let back = NormalizedEvent::from_json(&ev.to_json().unwrap()).unwrap();
        assert_eq!(back, ev);
        assert!(back.targets_protected());
    }
}
