// src/enrich.rs

//! # Event enrichment
//!
//! Fills the caller-side fields of a normalized event: executable path,
//! SHA-256 of that file, file age and process lifetime. Every lookup is
//! best-effort; a failed lookup leaves its field empty and the event moves on.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use chrono::Utc;
use log::Level;
use sha2::{Digest, Sha256};
use shared::event::NormalizedEvent;

use crate::{config::AgentContext, introspect::ProcessIntrospector, warden_log};

/// Executables remembered by [`HashCache`] before it starts over.
const HASH_CACHE_CAPACITY: usize = 4096;

pub struct Enricher {
    ctx: AgentContext,
    introspector: Arc<dyn ProcessIntrospector>,
    hashes: HashCache,
}

impl Enricher {
    pub fn new(ctx: AgentContext, introspector: Arc<dyn ProcessIntrospector>) -> Self {
        Self { ctx, introspector, hashes: HashCache::new(HASH_CACHE_CAPACITY) }
    }

    pub fn context(&self) -> AgentContext {
        self.ctx
    }

    /// Stamp and enrich `ev` in place.
    pub fn enrich(&self, ev: &mut NormalizedEvent) {
        ev.timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        ev.to_protected_pid = self.ctx.protected_pid;

        let pid = ev.caller_pid;
        if pid == 0 {
            return;
        }
        let now = SystemTime::now();

        match self.introspector.executable_path(pid) {
            Ok(path) => {
                match self.hashes.hash(&path) {
                    Ok(h) => ev.path_hash = h,
                    Err(e) => warden_log!(Level::Debug, "enrich", "hash {:?}: {}", path, e),
                }
                match std::fs::metadata(&path).and_then(|m| m.created()) {
                    Ok(created) => ev.path_age = seconds_between(created, now),
                    Err(e) => warden_log!(Level::Debug, "enrich", "age {:?}: {}", path, e),
                }
                ev.path = path.to_string_lossy().into_owned();
            }
            Err(e) => warden_log!(Level::Debug, "enrich", "path of pid {}: {}", pid, e),
        }

        match self.introspector.start_time(pid) {
            Ok(started) => ev.lifetime = seconds_between(started, now),
            Err(e) => warden_log!(Level::Debug, "enrich", "lifetime of pid {}: {}", pid, e),
        }
    }
}

/// Whole seconds from `earlier` to `later`, zero if the clock disagrees.
fn seconds_between(earlier: SystemTime, later: SystemTime) -> i64 {
    later
        .duration_since(earlier)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct Stamped {
    modified: SystemTime,
    len: u64,
    hash: String,
}

/// File hashes keyed on path. An entry is reused while the file keeps its
/// size and modification time.
pub struct HashCache {
    entries: Mutex<HashMap<PathBuf, Stamped>>,
    capacity: usize,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hash(&self, path: &Path) -> io::Result<String> {
        let meta = fs::metadata(path)?;
        let modified = meta.modified()?;
        let len = meta.len();
        {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(hit) = entries.get(path) {
                if hit.modified == modified && hit.len == len {
                    return Ok(hit.hash.clone());
                }
            }
        }

        // hashed without the lock held
        let hash = hash_file(path)?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity && !entries.contains_key(path) {
            entries.clear();
        }
        entries.insert(path.to_path_buf(), Stamped { modified, len, hash: hash.clone() });
        Ok(hash)
    }
}

/// Lower-case hex SHA-256 of the whole file, streamed.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(64 * 1024, File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::{IntrospectError, RegionKind};
    use shared::event::EventKind;
    use std::{
        io::Write,
        path::PathBuf,
        time::Duration,
    };

    struct Fixed {
        exe: Option<PathBuf>,
        started: Option<SystemTime>,
    }

    impl ProcessIntrospector for Fixed {
        fn executable_path(&self, pid: i32) -> Result<PathBuf, IntrospectError> {
            self.exe.clone().ok_or(IntrospectError::NoSuchProcess(pid))
        }
        fn start_time(&self, pid: i32) -> Result<SystemTime, IntrospectError> {
            self.started.ok_or(IntrospectError::AccessDenied(pid))
        }
        fn region_kind(&self, _: i32, _: u64) -> Result<RegionKind, IntrospectError> {
            Ok(RegionKind::Image)
        }
    }

    fn ctx() -> AgentContext {
        AgentContext { protected_pid: 100, agent_pid: 1 }
    }

    #[test]
    fn hashes_known_content() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        assert_eq!(
            hash_file(f.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn cached_hash_follows_size_and_mtime() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        let cache = HashCache::new(8);
        let first = cache.hash(f.path()).unwrap();
        let stamp = std::fs::metadata(f.path()).unwrap().modified().unwrap();

        // same size and mtime: the stored hash is served without reading
        std::fs::write(f.path(), b"xyz").unwrap();
        f.as_file().set_modified(stamp).unwrap();
        assert_eq!(cache.hash(f.path()).unwrap(), first);

        f.as_file().set_modified(stamp + Duration::from_secs(10)).unwrap();
        let second = cache.hash(f.path()).unwrap();
        assert_ne!(second, first);
        assert_eq!(second, hash_file(f.path()).unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_cache_starts_over() {
        let files: Vec<_> = (0..3)
            .map(|i| {
                let mut f = tempfile::NamedTempFile::new().unwrap();
                write!(f, "file {i}").unwrap();
                f
            })
            .collect();
        let cache = HashCache::new(2);
        for f in &files {
            cache.hash(f.path()).unwrap();
        }
        assert_eq!(cache.len(), 1);
        assert!(cache.hash(Path::new("/no/such/file")).is_err());
    }

    #[test]
    fn populates_every_field_it_can() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        let enricher = Enricher::new(
            ctx(),
            Arc::new(Fixed {
                exe: Some(f.path().to_path_buf()),
                started: Some(SystemTime::now() - Duration::from_secs(90)),
            }),
        );

        let mut ev = NormalizedEvent::new(EventKind::ObjectOp);
        ev.process_id = 100;
        ev.caller_pid = 555;
        enricher.enrich(&mut ev);

        assert_eq!(ev.path, f.path().to_string_lossy());
        assert_eq!(ev.path_hash.len(), 64);
        assert!((89..=91).contains(&ev.lifetime), "lifetime {}", ev.lifetime);
        assert!(ev.path_age >= 0);
        assert_eq!(ev.to_protected_pid, 100);
        assert!(ev.timestamp > 0);
    }

    #[test]
    fn one_failed_lookup_does_not_block_the_others() {
        let enricher = Enricher::new(
            ctx(),
            Arc::new(Fixed { exe: None, started: Some(SystemTime::now() - Duration::from_secs(5)) }),
        );
        let mut ev = NormalizedEvent::new(EventKind::ThreadCreate);
        ev.caller_pid = 9;
        enricher.enrich(&mut ev);
        assert_eq!(ev.path, "");
        assert_eq!(ev.path_hash, "");
        assert!(ev.lifetime >= 4);

        let enricher = Enricher::new(ctx(), Arc::new(Fixed { exe: None, started: None }));
        let mut ev = NormalizedEvent::new(EventKind::ThreadCreate);
        ev.caller_pid = 9;
        enricher.enrich(&mut ev);
        assert_eq!(ev.lifetime, 0);
        assert_eq!(ev.to_protected_pid, 100);
    }

    #[test]
    fn caller_zero_only_gets_stamped() {
        let enricher = Enricher::new(
            ctx(),
            Arc::new(Fixed { exe: Some("/bin/sh".into()), started: Some(SystemTime::now()) }),
        );
        let mut ev = NormalizedEvent::new(EventKind::ProcessCreate);
        enricher.enrich(&mut ev);
        assert_eq!(ev.path, "");
        assert_eq!(ev.lifetime, 0);
        assert_eq!(ev.to_protected_pid, 100);
        assert!(ev.timestamp > 0);
    }
}
