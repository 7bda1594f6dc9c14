//! Minifilter communication port.
//!
//! The kernel side is an opaque peer: we connect once with a small context
//! blob it uses for its authorization decision, then any number of receiver
//! threads block in [`MessagePort::receive`] on the same handle.

use std::sync::Arc;

use shared::cursor::ByteWriter;
use thiserror::Error;

use crate::config::AgentContext;

/// Version of the connect context understood by the driver.
pub const CONTEXT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("{op} failed: 0x{code:08X} ({message})")]
    Os {
        op: &'static str,
        code: u32,
        message: String,
    },

    #[error("port is closed")]
    Closed,

    #[error("kernel message ports are only available on Windows")]
    Unsupported,
}

/// Blocking source of raw port frames.
pub trait MessagePort: Send + Sync + 'static {
    /// Block until one frame has been written into `buf`.
    fn receive(&self, buf: &mut [u8]) -> Result<(), PortError>;

    /// Unblock pending receives and fail later ones with
    /// [`PortError::Closed`]. OS resources are released when the port is
    /// dropped.
    fn close(&self) {}
}

/// `{version: u32, to_protect_pid: i32, agent_pid: i32}`, little-endian.
pub fn connect_context(ctx: &AgentContext) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(12);
    w.put_u32(CONTEXT_VERSION)
        .put_i32(ctx.protected_pid)
        .put_i32(ctx.agent_pid);
    w.into_inner()
}

/// Facility-WIN32 HRESULTs (`0x8007xxxx`) carry a plain Win32 error code in
/// the low word; anything else is returned unchanged.
pub fn hresult_to_win32(hr: u32) -> u32 {
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        hr & 0xFFFF
    } else {
        hr
    }
}

/// `HRESULT_FROM_WIN32`.
pub fn hresult_from_win32(code: u32) -> u32 {
    if code == 0 || code & 0xFFFF_0000 != 0 {
        code
    } else {
        0x8007_0000 | code
    }
}

/// Human-readable text for an HRESULT, falling back to the hex value.
pub fn hresult_text(hr: u32) -> String {
    os_message(hresult_to_win32(hr)).unwrap_or_else(|| format!("HRESULT 0x{hr:08X}"))
}

/// Connect to the named port, announcing who we protect and who we are.
pub fn connect(name: &str, ctx: &AgentContext) -> Result<Arc<dyn MessagePort>, PortError> {
    #[cfg(windows)]
    {
        let port = win::FilterPort::connect(name, &connect_context(ctx))?;
        log::info!("connected to {name} (protected pid {}, agent pid {})", ctx.protected_pid, ctx.agent_pid);
        Ok(Arc::new(port))
    }
    #[cfg(not(windows))]
    {
        let _ = (name, ctx);
        Err(PortError::Unsupported)
    }
}

#[cfg(windows)]
fn os_message(code: u32) -> Option<String> {
    win::format_message(code)
}

#[cfg(not(windows))]
fn os_message(_code: u32) -> Option<String> {
    None
}

#[cfg(windows)]
mod win {
    use super::{PortError, hresult_from_win32, hresult_text};
    use std::{
        ffi::c_void,
        mem, ptr,
        sync::atomic::{AtomicBool, AtomicPtr, Ordering},
    };
    use windows_sys::Win32::{
        Foundation::{
            CloseHandle, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED, GetLastError, HANDLE,
        },
        Storage::InstallableFileSystems::{
            FILTER_MESSAGE_HEADER, FilterConnectCommunicationPort, FilterGetMessage,
        },
        System::{
            Diagnostics::Debug::{
                FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS, FormatMessageW,
            },
            IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED},
            Threading::CreateEventW,
        },
    };

    /// Port handle opened for overlapped I/O. `close` cancels every pending
    /// receive; the handle itself is released only on drop, after the last
    /// receiver has let go of the port.
    pub(super) struct FilterPort {
        handle: AtomicPtr<c_void>,
        closed: AtomicBool,
    }

    /// Manual-reset event owned by one receive call.
    struct Event(HANDLE);

    impl Event {
        fn new() -> Result<Self, PortError> {
            // SAFETY: no security attributes, unnamed event.
            let h = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
            if h.is_null() {
                // SAFETY: reads the calling thread's last-error value.
                let code = unsafe { GetLastError() };
                return Err(os_error("CreateEventW", hresult_from_win32(code)));
            }
            Ok(Self(h))
        }
    }

    impl Drop for Event {
        fn drop(&mut self) {
            // SAFETY: created by CreateEventW and closed once.
            unsafe { CloseHandle(self.0) };
        }
    }

    impl FilterPort {
        pub(super) fn connect(name: &str, context: &[u8]) -> Result<Self, PortError> {
            let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
            let mut handle: HANDLE = ptr::null_mut();
            // SAFETY: `wide` is NUL-terminated and `context` outlives the call.
            let hr = unsafe {
                FilterConnectCommunicationPort(
                    wide.as_ptr(),
                    0,
                    context.as_ptr().cast(),
                    context.len() as u16,
                    ptr::null(),
                    &mut handle,
                )
            };
            if hr != 0 {
                return Err(os_error("FilterConnectCommunicationPort", hr as u32));
            }
            Ok(Self { handle: AtomicPtr::new(handle), closed: AtomicBool::new(false) })
        }
    }

    impl super::MessagePort for FilterPort {
        fn receive(&self, buf: &mut [u8]) -> Result<(), PortError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PortError::Closed);
            }
            let handle = self.handle.load(Ordering::Acquire);
            let event = Event::new()?;
            // SAFETY: an all-zero OVERLAPPED is the documented initial state.
            let mut ov: OVERLAPPED = unsafe { mem::zeroed() };
            ov.hEvent = event.0;

            // SAFETY: `buf` and `ov` outlive the request; it is waited for
            // below before either goes out of scope.
            let hr = unsafe {
                FilterGetMessage(
                    handle,
                    buf.as_mut_ptr().cast::<FILTER_MESSAGE_HEADER>(),
                    buf.len() as u32,
                    &mut ov,
                )
            } as u32;
            if hr == 0 {
                return Ok(());
            }
            if hr != hresult_from_win32(ERROR_IO_PENDING) {
                return Err(os_error("FilterGetMessage", hr));
            }

            // a close that raced the request above did not see it; cancel it here
            if self.closed.load(Ordering::SeqCst) {
                // SAFETY: cancels only this request on a live handle.
                unsafe { CancelIoEx(handle, &ov) };
            }

            let mut transferred = 0u32;
            // SAFETY: waits for the request issued above to complete or cancel.
            let ok = unsafe { GetOverlappedResult(handle, &ov, &mut transferred, 1) };
            if ok != 0 {
                return Ok(());
            }
            // SAFETY: reads the calling thread's last-error value.
            let code = unsafe { GetLastError() };
            if code == ERROR_OPERATION_ABORTED || self.closed.load(Ordering::SeqCst) {
                return Err(PortError::Closed);
            }
            Err(os_error("FilterGetMessage", hresult_from_win32(code)))
        }

        fn close(&self) {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            // SAFETY: the handle stays open until drop; this only cancels
            // requests issued by any thread.
            unsafe { CancelIoEx(self.handle.load(Ordering::Acquire), ptr::null()) };
        }
    }

    impl Drop for FilterPort {
        fn drop(&mut self) {
            let handle = self.handle.swap(ptr::null_mut(), Ordering::AcqRel);
            if !handle.is_null() {
                // SAFETY: `&mut self` means no receive is in flight.
                unsafe { CloseHandle(handle) };
            }
        }
    }

    fn os_error(op: &'static str, code: u32) -> PortError {
        PortError::Os { op, code, message: hresult_text(code) }
    }

    pub(super) fn format_message(code: u32) -> Option<String> {
        let mut buf = [0u16; 512];
        // SAFETY: FormatMessageW writes at most `buf.len()` UTF-16 units.
        let n = unsafe {
            FormatMessageW(
                FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
                ptr::null(),
                code,
                0,
                buf.as_mut_ptr(),
                buf.len() as u32,
                ptr::null(),
            )
        };
        if n == 0 {
            return None;
        }
        let text = String::from_utf16_lossy(&buf[..n as usize]);
        Some(text.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_context_layout() {
        let ctx = AgentContext { protected_pid: 4242, agent_pid: 7 };
        let bytes = connect_context(&ctx);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &4242i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &7i32.to_le_bytes());
    }

    #[test]
    fn win32_facility_is_unwrapped() {
        // HRESULT_FROM_WIN32(ERROR_INVALID_HANDLE)
        assert_eq!(hresult_to_win32(0x8007_0006), 6);
        // ERROR_OPERATION_ABORTED
        assert_eq!(hresult_to_win32(0x8007_03E3), 0x3E3);
        // not facility WIN32
        assert_eq!(hresult_to_win32(0x8000_4005), 0x8000_4005);
    }

    #[test]
    fn win32_codes_wrap_into_hresults() {
        // ERROR_IO_PENDING, what an overlapped FilterGetMessage returns
        assert_eq!(hresult_from_win32(997), 0x8007_03E5);
        assert_eq!(hresult_to_win32(hresult_from_win32(997)), 997);
        assert_eq!(hresult_from_win32(0), 0);
        assert_eq!(hresult_from_win32(0x8007_0005), 0x8007_0005);
    }

    #[cfg(not(windows))]
    #[test]
    fn text_falls_back_to_hex_off_windows() {
        assert_eq!(hresult_text(0x8007_0005), "HRESULT 0x80070005");
        let ctx = AgentContext::new(1);
        assert!(matches!(connect("\\WardenComPort", &ctx), Err(PortError::Unsupported)));
    }
}
