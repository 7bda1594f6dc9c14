//! Win32 introspection: process handle, module path, process times and
//! remote `VirtualQueryEx`.

use std::{
    ffi::c_void,
    mem,
    path::PathBuf,
    ptr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use windows_sys::Win32::{
    Foundation::{
        CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, FILETIME, GetLastError, HANDLE,
    },
    System::{
        Memory::{MEM_FREE, MEM_IMAGE, MEM_MAPPED, MEMORY_BASIC_INFORMATION, VirtualQueryEx},
        ProcessStatus::GetModuleFileNameExW,
        Threading::{GetProcessTimes, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ},
    },
};

use super::{IntrospectError, ProcessIntrospector, RegionKind};

/// 100 ns intervals between 1601-01-01 and 1970-01-01.
const EPOCH_DIFF_100NS: u64 = 116_444_736_000_000_000;

pub struct WinIntrospector;

/// Owned process handle, closed on drop.
struct ProcessHandle(HANDLE);

impl ProcessHandle {
    fn open(pid: i32) -> Result<Self, IntrospectError> {
        // SAFETY: plain FFI call; a null return is handled below.
        let h = unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, 0, pid as u32) };
        if h.is_null() {
            return Err(last_error("OpenProcess", pid));
        }
        Ok(Self(h))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is owned and closed exactly once.
        unsafe { CloseHandle(self.0) };
    }
}

fn last_error(op: &'static str, pid: i32) -> IntrospectError {
    // SAFETY: reads the calling thread's last-error value.
    let code = unsafe { GetLastError() };
    match code {
        ERROR_ACCESS_DENIED => IntrospectError::AccessDenied(pid),
        ERROR_INVALID_PARAMETER => IntrospectError::NoSuchProcess(pid),
        code => IntrospectError::Os { op, code },
    }
}

fn filetime_to_system(ft: &FILETIME) -> SystemTime {
    let ticks = (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime);
    let since_unix = ticks.saturating_sub(EPOCH_DIFF_100NS);
    UNIX_EPOCH + Duration::from_nanos(since_unix.saturating_mul(100))
}

impl ProcessIntrospector for WinIntrospector {
    fn executable_path(&self, pid: i32) -> Result<PathBuf, IntrospectError> {
        let h = ProcessHandle::open(pid)?;
        let mut buf = [0u16; 1024];
        // SAFETY: the buffer length is passed in UTF-16 units.
        let n = unsafe { GetModuleFileNameExW(h.0, ptr::null_mut(), buf.as_mut_ptr(), buf.len() as u32) };
        if n == 0 {
            return Err(last_error("GetModuleFileNameExW", pid));
        }
        Ok(PathBuf::from(String::from_utf16_lossy(&buf[..n as usize])))
    }

    fn start_time(&self, pid: i32) -> Result<SystemTime, IntrospectError> {
        let h = ProcessHandle::open(pid)?;
        let zero = FILETIME { dwLowDateTime: 0, dwHighDateTime: 0 };
        let (mut created, mut exited, mut kernel, mut user) = (zero, zero, zero, zero);
        // SAFETY: all four out-pointers are valid FILETIMEs.
        let ok = unsafe { GetProcessTimes(h.0, &mut created, &mut exited, &mut kernel, &mut user) };
        if ok == 0 {
            return Err(last_error("GetProcessTimes", pid));
        }
        Ok(filetime_to_system(&created))
    }

    fn region_kind(&self, pid: i32, address: u64) -> Result<RegionKind, IntrospectError> {
        let h = ProcessHandle::open(pid)?;
        // SAFETY: MEMORY_BASIC_INFORMATION is plain old data.
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        // SAFETY: `mbi` is writable and its size is passed along.
        let n = unsafe {
            VirtualQueryEx(
                h.0,
                address as usize as *const c_void,
                &mut mbi,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if n == 0 {
            return Err(last_error("VirtualQueryEx", pid));
        }
        Ok(if mbi.State == MEM_FREE {
            RegionKind::Free
        } else if mbi.Type == MEM_IMAGE {
            RegionKind::Image
        } else if mbi.Type == MEM_MAPPED {
            RegionKind::Mapped
        } else {
            RegionKind::Private
        })
    }
}
