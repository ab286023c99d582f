//! Process introspection: memory, thread census and open descriptors.
//!
//! Everything here is a pure read of OS or runtime state. Failures never
//! propagate: a collector that cannot read its source logs one line and
//! returns [`UNKNOWN`] or an empty list, so a snapshot is always produced.
//!
//! # Platform Support
//!
//! - **Linux**: `/proc/self/status` (`VmRSS:`, `Threads:`),
//!   `/proc/self/task/*/comm`, `/proc/self/fd/*`
//! - **macOS**: descriptors from `/dev/fd`; memory and thread names report
//!   the unknown sentinel
//! - **Other**: unknown sentinel and empty collections
//!
//! The "managed" figures come from a host-supplied [`ManagedRuntime`]: the
//! layer above the OS (a toolkit's resource tracker, an embedded interpreter)
//! that keeps its own heap accounting and thread registry.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::config::DescriptorFilter;

/// Sentinel for a figure that could not be read.
pub const UNKNOWN: i64 = -1;

// =============================================================================
// Introspector trait
// =============================================================================

/// Source of raw resource facts for one process.
///
/// [`crate::snapshot::Snapshot::collect`] calls these in a fixed order:
/// `quiesce`, resident memory, OS threads, managed memory, managed threads,
/// descriptors.
pub trait Introspector {
    /// Best-effort noise reduction before measuring (e.g. a collection pass).
    fn quiesce(&self) {}

    /// Resident set size in bytes, or [`UNKNOWN`].
    fn resident_memory(&self) -> i64;

    /// Runtime-reported allocated minus free bytes.
    fn managed_memory(&self) -> i64;

    /// Names of all live OS threads of the process.
    fn os_thread_names(&self) -> Vec<String>;

    /// Names of threads the managed runtime knows about.
    fn managed_thread_names(&self) -> Vec<String>;

    /// Resolved targets of every open descriptor. `None` marks a descriptor
    /// whose link could not be resolved.
    fn open_descriptor_paths(&self) -> Vec<Option<String>>;
}

/// Borrowed view of an [`Introspector`] that applies a [`DescriptorFilter`]
/// on top of whatever the inner probe reports.
///
/// Unresolved (`None`) descriptors pass through unchanged.
#[derive(Debug)]
pub struct FilteredIntrospector<'a, P: ?Sized> {
    inner: &'a P,
    filter: &'a DescriptorFilter,
}

impl<'a, P: Introspector + ?Sized> FilteredIntrospector<'a, P> {
    #[must_use]
    pub fn new(inner: &'a P, filter: &'a DescriptorFilter) -> Self {
        Self { inner, filter }
    }
}

impl<P: Introspector + ?Sized> Introspector for FilteredIntrospector<'_, P> {
    fn quiesce(&self) {
        self.inner.quiesce();
    }

    fn resident_memory(&self) -> i64 {
        self.inner.resident_memory()
    }

    fn managed_memory(&self) -> i64 {
        self.inner.managed_memory()
    }

    fn os_thread_names(&self) -> Vec<String> {
        self.inner.os_thread_names()
    }

    fn managed_thread_names(&self) -> Vec<String> {
        self.inner.managed_thread_names()
    }

    fn open_descriptor_paths(&self) -> Vec<Option<String>> {
        let mut paths = self.inner.open_descriptor_paths();
        paths.retain(|target| target.as_deref().is_none_or(|t| self.filter.keeps(t)));
        paths
    }
}

// =============================================================================
// Managed runtime probe
// =============================================================================

/// Host hooks for the runtime layer above the OS.
pub trait ManagedRuntime: Send + Sync {
    /// Allocated minus free bytes as the runtime accounts them.
    fn used_memory(&self) -> i64;

    /// Names of threads registered with the runtime.
    fn thread_names(&self) -> Vec<String>;

    /// Optional reclamation pass. No guarantee anything is reclaimed.
    fn quiesce(&self) {}
}

/// No managed layer: zero memory, no threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRuntime;

impl ManagedRuntime for NullRuntime {
    fn used_memory(&self) -> i64 {
        0
    }

    fn thread_names(&self) -> Vec<String> {
        Vec::new()
    }
}

type QuiesceHook = Box<dyn Fn() + Send + Sync>;

/// Registry-backed runtime: threads spawned through it are counted by name
/// until their body returns, and the heap gauge follows
/// [`track_alloc`](Self::track_alloc) / [`track_free`](Self::track_free).
pub struct TrackedRuntime {
    threads: Mutex<HashMap<u64, String>>,
    next_id: AtomicU64,
    heap_bytes: AtomicI64,
    quiesce_hook: Option<QuiesceHook>,
}

impl std::fmt::Debug for TrackedRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedRuntime")
            .field("threads", &self.thread_names())
            .field("heap_bytes", &self.used_memory())
            .field("quiesce_hook", &self.quiesce_hook.is_some())
            .finish()
    }
}

impl Default for TrackedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackedRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            heap_bytes: AtomicI64::new(0),
            quiesce_hook: None,
        }
    }

    /// Install a hook run by [`ManagedRuntime::quiesce`].
    #[must_use]
    pub fn with_quiesce_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.quiesce_hook = Some(Box::new(hook));
        self
    }

    pub fn track_alloc(&self, bytes: i64) {
        self.heap_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn track_free(&self, bytes: i64) {
        self.heap_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// Spawn a named OS thread that stays in the census until `f` returns.
    ///
    /// The thread is registered before it starts, so a snapshot taken right
    /// after `spawn` returns already counts it.
    pub fn spawn<F, T>(self: &Arc<Self>, name: &str, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.threads
            .lock()
            .expect("lock poisoned")
            .insert(id, name.to_string());

        let guard = Registration {
            runtime: Arc::clone(self),
            id,
        };
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                f()
            });
        if spawned.is_err() {
            // the closure (and with it the guard) was dropped, which
            // already deregistered the id
            debug!(thread = name, "tracked thread failed to spawn");
        }
        spawned
    }

    fn deregister(&self, id: u64) {
        self.threads.lock().expect("lock poisoned").remove(&id);
    }
}

struct Registration {
    runtime: Arc<TrackedRuntime>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.runtime.deregister(self.id);
    }
}

impl ManagedRuntime for TrackedRuntime {
    fn used_memory(&self) -> i64 {
        self.heap_bytes.load(Ordering::SeqCst)
    }

    fn thread_names(&self) -> Vec<String> {
        self.threads
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn quiesce(&self) {
        if let Some(hook) = &self.quiesce_hook {
            hook();
        }
    }
}

// =============================================================================
// procfs-backed introspector
// =============================================================================

/// Reads a procfs-style directory (`status`, `task/`, `fd/`).
///
/// The root is configurable so tests can point it at a fabricated tree.
pub struct ProcIntrospector {
    root: PathBuf,
    fd_dir: PathBuf,
    filter: DescriptorFilter,
    runtime: Arc<dyn ManagedRuntime>,
}

impl std::fmt::Debug for ProcIntrospector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcIntrospector")
            .field("root", &self.root)
            .field("fd_dir", &self.fd_dir)
            .field("filter", &self.filter)
            .finish()
    }
}

impl ProcIntrospector {
    /// Introspect the current process.
    #[must_use]
    pub fn current() -> Self {
        if !cfg!(target_os = "linux") {
            static WARNED: Once = Once::new();
            WARNED.call_once(|| {
                warn!(
                    os = std::env::consts::OS,
                    "procfs unavailable; memory and thread figures will be unknown"
                );
            });
        }
        let root = PathBuf::from("/proc/self");
        let fd_dir = if cfg!(target_os = "macos") {
            PathBuf::from("/dev/fd")
        } else {
            root.join("fd")
        };
        Self {
            root,
            fd_dir,
            filter: DescriptorFilter::default(),
            runtime: Arc::new(NullRuntime),
        }
    }

    /// Introspect an arbitrary procfs-style directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            fd_dir: root.join("fd"),
            root,
            filter: DescriptorFilter::default(),
            runtime: Arc::new(NullRuntime),
        }
    }

    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn ManagedRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: DescriptorFilter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// OS thread count from the `Threads:` status field, or [`UNKNOWN`].
    ///
    /// Only a cross-check for the per-task census, so failures are silent;
    /// [`Introspector::resident_memory`] reports an unreadable status.
    pub fn system_thread_count(&self) -> i64 {
        std::fs::read_to_string(self.root.join("status"))
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find_map(|line| line.strip_prefix("Threads:"))
                    .and_then(|value| value.trim().parse().ok())
            })
            .unwrap_or(UNKNOWN)
    }

    fn read_status_field(&self, prefix: &str) -> Option<String> {
        let path = self.root.join("status");
        let status = match std::fs::read_to_string(&path) {
            Ok(status) => status,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read process status");
                return None;
            }
        };
        let found = status
            .lines()
            .find_map(|line| line.strip_prefix(prefix).map(str::to_string));
        if found.is_none() {
            warn!(path = %path.display(), field = prefix, "status field missing");
        }
        found
    }

    fn resolve_descriptor(&self, path: &Path) -> Option<String> {
        let is_link = std::fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            return Some(path.to_string_lossy().into_owned());
        }
        match std::fs::read_link(path) {
            Ok(target) => Some(target.to_string_lossy().into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // closed between listing and resolving
                debug!(fd = %path.display(), "descriptor closed during enumeration");
                None
            }
            Err(err) => {
                warn!(fd = %path.display(), error = %err, "failed to resolve descriptor link");
                None
            }
        }
    }
}

impl Introspector for ProcIntrospector {
    fn quiesce(&self) {
        self.runtime.quiesce();
    }

    fn resident_memory(&self) -> i64 {
        let Some(value) = self.read_status_field("VmRSS:") else {
            return UNKNOWN;
        };
        match parse_kb_value(&value) {
            Some(kb) => kb.saturating_mul(1024),
            None => {
                warn!(value = value.trim(), "unparseable VmRSS: field");
                UNKNOWN
            }
        }
    }

    fn managed_memory(&self) -> i64 {
        self.runtime.used_memory()
    }

    fn os_thread_names(&self) -> Vec<String> {
        let task_dir = self.root.join("task");
        let entries = match std::fs::read_dir(&task_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %task_dir.display(), error = %err, "failed to list threads");
                return Vec::new();
            }
        };

        // a thread may exit between listing and reading its comm; skip it
        let names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("comm")).ok())
            .map(|comm| comm.trim().to_string())
            .collect();

        let reported = self.system_thread_count();
        if reported != UNKNOWN && reported != names.len() as i64 {
            debug!(
                reported,
                census = names.len(),
                "thread census differs from status count"
            );
        }
        names
    }

    fn managed_thread_names(&self) -> Vec<String> {
        self.runtime.thread_names()
    }

    fn open_descriptor_paths(&self) -> Vec<Option<String>> {
        let entries = match std::fs::read_dir(&self.fd_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.fd_dir.display(), error = %err, "failed to list open descriptors");
                return Vec::new();
            }
        };

        let mut paths: Vec<Option<String>> = entries
            .filter_map(Result::ok)
            .map(|entry| self.resolve_descriptor(&entry.path()))
            .filter(|target| target.as_deref().is_none_or(|t| self.filter.keeps(t)))
            .collect();
        paths.sort();
        paths
    }
}

/// Parse a value like "  12345 kB" → Some(12345).
fn parse_kb_value(s: &str) -> Option<i64> {
    s.trim().strip_suffix("kB")?.trim().parse().ok()
}
