//! `/proc`-backed introspection.

use std::{
    fs, io,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use super::{IntrospectError, ProcessIntrospector, RegionKind};

pub struct ProcfsIntrospector {
    root: PathBuf,
    ticks_per_sec: u64,
}

impl Default for ProcfsIntrospector {
    fn default() -> Self {
        // SAFETY: sysconf has no preconditions.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self::with_root("/proc", if ticks > 0 { ticks as u64 } else { 100 })
    }
}

impl ProcfsIntrospector {
    pub fn with_root(root: impl Into<PathBuf>, ticks_per_sec: u64) -> Self {
        Self { root: root.into(), ticks_per_sec }
    }

    fn pid_file(&self, pid: i32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }
}

fn classify_io(pid: i32, e: io::Error) -> IntrospectError {
    match e.kind() {
        io::ErrorKind::NotFound => IntrospectError::NoSuchProcess(pid),
        io::ErrorKind::PermissionDenied => IntrospectError::AccessDenied(pid),
        _ => IntrospectError::Io(e),
    }
}

impl ProcessIntrospector for ProcfsIntrospector {
    fn executable_path(&self, pid: i32) -> Result<PathBuf, IntrospectError> {
        fs::read_link(self.pid_file(pid, "exe")).map_err(|e| classify_io(pid, e))
    }

    fn start_time(&self, pid: i32) -> Result<SystemTime, IntrospectError> {
        let stat = fs::read_to_string(self.pid_file(pid, "stat")).map_err(|e| classify_io(pid, e))?;
        let ticks = start_ticks(&stat).ok_or(IntrospectError::Parse { what: "stat" })?;
        let sys = fs::read_to_string(self.root.join("stat"))?;
        let btime = boot_time(&sys).ok_or(IntrospectError::Parse { what: "btime" })?;

        let since_boot = Duration::from_secs_f64(ticks as f64 / self.ticks_per_sec as f64);
        Ok(UNIX_EPOCH + Duration::from_secs(btime) + since_boot)
    }

    fn region_kind(&self, pid: i32, address: u64) -> Result<RegionKind, IntrospectError> {
        let maps = fs::read_to_string(self.pid_file(pid, "maps")).map_err(|e| classify_io(pid, e))?;
        region_in_maps(&maps, address)
    }
}

/// Field 22 of `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn start_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // rest starts at field 3 (state)
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn boot_time(sys_stat: &str) -> Option<u64> {
    sys_stat
        .lines()
        .find_map(|l| l.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}

/// Classify the mapping containing `address`:
/// file-backed private mappings are images, shared file mappings are data
/// views, anonymous and `memfd:` mappings are private memory.
fn region_in_maps(maps: &str, address: u64) -> Result<RegionKind, IntrospectError> {
    for line in maps.lines() {
        let mut cols = line.splitn(6, char::is_whitespace);
        let range = cols.next().unwrap_or_default();
        let perms = cols.next().unwrap_or_default();
        let path = cols.nth(3).unwrap_or_default().trim();

        let Some((lo, hi)) = range.split_once('-') else {
            return Err(IntrospectError::Parse { what: "maps" });
        };
        let (Ok(lo), Ok(hi)) = (u64::from_str_radix(lo, 16), u64::from_str_radix(hi, 16)) else {
            return Err(IntrospectError::Parse { what: "maps" });
        };
        if address < lo || address >= hi {
            continue;
        }

        let kind = if path.starts_with("/memfd:") || path.is_empty() {
            RegionKind::Private
        } else if path == "[vdso]" || path == "[vsyscall]" {
            RegionKind::Image
        } else if path.starts_with('[') {
            RegionKind::Private
        } else if perms.as_bytes().get(3) == Some(&b's') {
            RegionKind::Mapped
        } else {
            RegionKind::Image
        };
        return Ok(kind);
    }
    Ok(RegionKind::Free)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a21000 r-xp 00000000 08:01 131 /usr/bin/game
7f0000000000-7f0000021000 rw-p 00000000 00:00 0
7f1000000000-7f1000010000 rw-s 00000000 08:01 77 /var/cache/shared.bin
7f2000000000-7f2000001000 r-xp 00000000 00:01 5 /memfd:payload (deleted)
7ffd00000000-7ffd00002000 r-xp 00000000 00:00 0 [vdso]
7ffe00000000-7ffe00021000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn maps_regions_are_classified() {
        assert_eq!(region_in_maps(MAPS, 0x55d0_c0a0_0100).unwrap(), RegionKind::Image);
        assert_eq!(region_in_maps(MAPS, 0x7f00_0000_0010).unwrap(), RegionKind::Private);
        assert_eq!(region_in_maps(MAPS, 0x7f10_0000_0000).unwrap(), RegionKind::Mapped);
        assert_eq!(region_in_maps(MAPS, 0x7f20_0000_0000).unwrap(), RegionKind::Private);
        assert_eq!(region_in_maps(MAPS, 0x7ffd_0000_0000).unwrap(), RegionKind::Image);
        assert_eq!(region_in_maps(MAPS, 0x7ffe_0000_0000).unwrap(), RegionKind::Private);
        // end address is exclusive
        assert_eq!(region_in_maps(MAPS, 0x55d0_c0a2_1000).unwrap(), RegionKind::Free);
    }

    #[test]
    fn stat_start_time_survives_odd_comm() {
        let stat = "4242 (we ird) proc) S 1 4242 4242 0 -1 4194560 100 0 0 0 \
                    5 3 0 0 20 0 1 0 12345 1000000 200 18446744073709551615";
        assert_eq!(start_ticks(stat), Some(12345));
        assert_eq!(boot_time("cpu 1 2 3\nbtime 1700000000\nprocesses 9\n"), Some(1_700_000_000));
    }

    #[test]
    fn fake_proc_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("77");
        fs::create_dir(&pid_dir).unwrap();
        fs::write(
            pid_dir.join("stat"),
            "77 (svc) S 1 77 77 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 500 0 0",
        )
        .unwrap();
        fs::write(dir.path().join("stat"), "btime 1000\n").unwrap();
        fs::write(pid_dir.join("maps"), MAPS).unwrap();

        let procfs = ProcfsIntrospector::with_root(dir.path(), 100);
        let started = procfs.start_time(77).unwrap();
        assert_eq!(started, UNIX_EPOCH + Duration::from_secs(1005));
        assert_eq!(procfs.region_kind(77, 0x7f00_0000_0000).unwrap(), RegionKind::Private);
        assert!(matches!(procfs.start_time(78), Err(IntrospectError::NoSuchProcess(78))));
        assert!(matches!(procfs.executable_path(78), Err(IntrospectError::NoSuchProcess(78))));
    }
}
