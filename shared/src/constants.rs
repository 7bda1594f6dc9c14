use std::time::Duration;

/// Minifilter communication port opened by the agent.
pub const DEFAULT_PORT_NAME: &str = r"\WardenComPort";

/// UTF-16 capacity of path-like fields (`MAX_PATH`).
pub const PATH_CAPACITY: usize = 260;
/// UTF-16 capacity of command lines.
pub const COMMAND_CAPACITY: usize = 1024;

pub const DEFAULT_RECEIVERS: usize = 4;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_JOB_QUEUE_CAPACITY: usize = 8192;
pub const DEFAULT_DETECTOR_QUEUE_CAPACITY: usize = 4096;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;
pub const DEFAULT_AGENT_PING_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_COLLECTOR_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_JITTER: Duration = Duration::from_millis(250);

/// Upper bound on a single transport frame (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// Command broadcast by the collector to ask agents for a module scan.
pub const SCAN_COMMAND: &str = "scan";
