/// Logs a line attributed to a pipeline component.
///
/// The component becomes the record target, so the dispatcher set up in
/// [`crate::logging`] prints it in the `[target]` slot next to pid and tid.
/// Usage:
/// ```rust
/// use log::Level;
/// warden::warden_log!(Level::Info, "ingest", "receivers started");
/// warden::warden_log!(Level::Warn, "port", "receive failed: {}", "0x80070006");
/// ```
/// Logs like:
/// [2025-04-25T16:32:10+02:00][WARN ][port][pid=4568][tid=ThreadId(7)] receive failed: 0x80070006
#[macro_export]
macro_rules! warden_log {
    ($level:expr, $component:expr, $fmt:expr $(, $($arg:tt)+)?) => {
        log::log!(target: $component, $level, $fmt $(, $($arg)+)?)
    };
}
