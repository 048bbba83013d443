// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

//! Named ring-buffer journals for non-crash diagnostics.
//!
//! Subsystems create a named [`RingBuffer`]-backed object, submit typed
//! entries into it, and either save snapshots on demand or have the buffer
//! flushed when the process exits or crashes. Destruction is two-phase: the
//! slot frees immediately, the backing buffer is reclaimed later, so a
//! writer racing a destroy never observes a freed buffer.

pub mod ring;

use ring::{Entry, RingBuffer, RingError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Mutex;

/// Fixed object pool size; creation fails once every slot is active.
pub const MAX_TRACE_OBJECTS: usize = 32;
pub const MAX_TRACE_NAME: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace object pool is exhausted ({MAX_TRACE_OBJECTS} slots)")]
    PoolExhausted,
    #[error("a trace object named {0:?} is already active")]
    NameExists(String),
    #[error("a destroyed trace object named {0:?} has not been reclaimed yet")]
    NamePendingReclaim(String),
    #[error("invalid trace object name {0:?}")]
    InvalidName(String),
    #[error("handle does not refer to an active trace object")]
    InvalidHandle,
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Opaque reference to a pool slot. The generation makes handles from a
/// destroyed object invalid even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHandle {
    slot: usize,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Byte budget for entry payloads; oldest entries are evicted first.
    pub capacity_bytes: usize,
    /// Move the buffer to the exit list on destroy instead of dropping it,
    /// so its contents survive until the process-exit flush.
    pub flush_on_exit: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024,
            flush_on_exit: false,
        }
    }
}

struct ObjectState {
    name: String,
    flush_on_exit: bool,
    pid: u32,
    ring: RingBuffer,
}

/// A buffer detached from its slot, awaiting reclamation or exit flush.
struct DeferredNode {
    name: String,
    pid: u32,
    ring: RingBuffer,
}

struct Manager {
    slots: [Option<ObjectState>; MAX_TRACE_OBJECTS],
    generations: [u64; MAX_TRACE_OBJECTS],
    delete_list: Vec<DeferredNode>,
    exit_list: Vec<DeferredNode>,
}

impl Manager {
    const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_TRACE_OBJECTS],
            generations: [0; MAX_TRACE_OBJECTS],
            delete_list: Vec::new(),
            exit_list: Vec::new(),
        }
    }

    fn resolve(&self, handle: TraceHandle) -> Result<&ObjectState, TraceError> {
        if handle.slot >= MAX_TRACE_OBJECTS || self.generations[handle.slot] != handle.generation {
            return Err(TraceError::InvalidHandle);
        }
        self.slots[handle.slot].as_ref().ok_or(TraceError::InvalidHandle)
    }

    fn resolve_mut(&mut self, handle: TraceHandle) -> Result<&mut ObjectState, TraceError> {
        if handle.slot >= MAX_TRACE_OBJECTS || self.generations[handle.slot] != handle.generation {
            return Err(TraceError::InvalidHandle);
        }
        self.slots[handle.slot].as_mut().ok_or(TraceError::InvalidHandle)
    }
}

static MANAGER: Mutex<Manager> = Mutex::new(Manager::new());
static SAVE_SEQ: AtomicU64 = AtomicU64::new(0);

fn lock() -> std::sync::MutexGuard<'static, Manager> {
    // A poisoned manager only means a panic mid-update in another test or
    // thread; the state itself is still structurally sound.
    MANAGER.lock().unwrap_or_else(|e| e.into_inner())
}

fn validate_name(name: &str) -> Result<(), TraceError> {
    if name.is_empty()
        || name.len() > MAX_TRACE_NAME
        || name.contains('/')
        || name.contains("..")
    {
        return Err(TraceError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Allocates the next free pool slot for a new named journal. Exactly one
/// active object may hold a given name; a destroyed object blocks
/// re-creation under its name until its buffer has been reclaimed.
pub fn create(name: &str, config: TraceConfig) -> Result<TraceHandle, TraceError> {
    validate_name(name)?;
    let mut manager = lock();
    if manager
        .slots
        .iter()
        .flatten()
        .any(|state| state.name == name)
    {
        return Err(TraceError::NameExists(name.to_string()));
    }
    if manager.delete_list.iter().any(|node| node.name == name) {
        return Err(TraceError::NamePendingReclaim(name.to_string()));
    }
    let Some(slot) = manager.slots.iter().position(Option::is_none) else {
        return Err(TraceError::PoolExhausted);
    };
    manager.generations[slot] += 1;
    let generation = manager.generations[slot];
    manager.slots[slot] = Some(ObjectState {
        name: name.to_string(),
        flush_on_exit: config.flush_on_exit,
        pid: std::process::id(),
        ring: RingBuffer::new(config.capacity_bytes),
    });
    tracing::debug!(name, slot, "trace object created");
    Ok(TraceHandle { slot, generation })
}

/// Linear lookup over active slots.
pub fn get(name: &str) -> Option<TraceHandle> {
    let manager = lock();
    manager.slots.iter().enumerate().find_map(|(slot, state)| {
        state.as_ref().and_then(|state| {
            (state.name == name).then_some(TraceHandle {
                slot,
                generation: manager.generations[slot],
            })
        })
    })
}

/// Appends one entry to an active object's ring.
pub fn submit(handle: TraceHandle, kind: u32, data: &[u8]) -> Result<(), TraceError> {
    let mut manager = lock();
    let state = manager.resolve_mut(handle)?;
    state.ring.push(kind, data)?;
    Ok(())
}

/// Two-phase destroy: the slot frees immediately, the backing buffer moves
/// to the exit list (flush-on-exit objects, replacing any prior same-named
/// entry) or the delete list (everything else) for later reclamation.
pub fn destroy(handle: TraceHandle) -> Result<(), TraceError> {
    let mut manager = lock();
    manager.resolve(handle)?;
    manager.generations[handle.slot] += 1;
    let state = manager.slots[handle.slot]
        .take()
        .ok_or(TraceError::InvalidHandle)?;
    let node = DeferredNode {
        name: state.name,
        pid: state.pid,
        ring: state.ring,
    };
    if state.flush_on_exit {
        // A newer same-named journal supersedes the pending one; the old
        // buffer is dropped first.
        manager.exit_list.retain(|pending| pending.name != node.name);
        manager.exit_list.push(node);
    } else {
        manager.delete_list.push(node);
    }
    Ok(())
}

/// Reclamation probe: drops every buffer on the delete list and unblocks
/// re-creation of their names. Returns how many buffers were freed.
pub fn reclaim() -> usize {
    let mut manager = lock();
    let freed = manager.delete_list.len();
    manager.delete_list.clear();
    freed
}

#[derive(Serialize)]
struct ItemRecord {
    kind: u32,
    len: usize,
    data: String,
}

#[derive(Serialize)]
struct SavedRecord<'a> {
    name: &'a str,
    pid: u32,
    entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    items: Option<Vec<ItemRecord>>,
}

fn trace_root() -> PathBuf {
    npud_crashdump::recorder::paths::resolve_diag_root().join("trace")
}

fn persist(root: &Path, name: &str, pid: u32, entries: &[Entry]) -> Result<PathBuf, TraceError> {
    std::fs::create_dir_all(root)?;
    // An empty buffer saves as a flat record, a non-empty one carries the
    // per-entry list.
    let record = SavedRecord {
        name,
        pid,
        entries: entries.len(),
        items: (!entries.is_empty()).then(|| {
            entries
                .iter()
                .map(|entry| ItemRecord {
                    kind: entry.kind,
                    len: entry.bytes.len(),
                    data: String::from_utf8_lossy(&entry.bytes).into_owned(),
                })
                .collect()
        }),
    };
    let seq = SAVE_SEQ.fetch_add(1, SeqCst);
    let path = root.join(format!("{name}_{pid}_{seq}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
    tracing::debug!(name, path = %path.display(), entries = entries.len(), "trace saved");
    Ok(path)
}

/// Persists a snapshot of one object, or of every active object when
/// `handle` is `None`. The manager lock is held only while copying one
/// object's buffer; persistence happens unlocked.
pub fn save(handle: Option<TraceHandle>) -> Result<usize, TraceError> {
    let root = trace_root();
    let targets: Vec<TraceHandle> = match handle {
        Some(handle) => vec![handle],
        None => {
            let manager = lock();
            manager
                .slots
                .iter()
                .enumerate()
                .filter(|(_, state)| state.is_some())
                .map(|(slot, _)| TraceHandle {
                    slot,
                    generation: manager.generations[slot],
                })
                .collect()
        }
    };
    let mut saved = 0usize;
    for target in targets {
        let copy = {
            let manager = lock();
            match manager.resolve(target) {
                Ok(state) => (state.name.clone(), state.pid, state.ring.snapshot()),
                // An object destroyed between enumeration and copy is
                // simply skipped; an explicit handle still reports it.
                Err(e) if handle.is_some() => return Err(e),
                Err(_) => continue,
            }
        };
        persist(&root, &copy.0, copy.1, &copy.2)?;
        saved += 1;
    }
    Ok(saved)
}

/// Drains the exit list, persisting every pending flush-on-exit buffer.
/// Call once during orderly process teardown.
pub fn flush_at_exit() -> Result<usize, TraceError> {
    let root = trace_root();
    let pending = {
        let mut manager = lock();
        std::mem::take(&mut manager.exit_list)
    };
    let mut flushed = 0usize;
    for node in &pending {
        persist(&root, &node.name, node.pid, &node.ring.snapshot())?;
        flushed += 1;
    }
    Ok(flushed)
}

/// Crash-time flush, registered with the crash router via
/// [`register_crash_flush`]. Runs after the collector has finished, so the
/// process is stable enough to allocate, but the manager lock may be held
/// by the interrupted thread; a try-lock keeps this from deadlocking.
pub extern "C" fn crash_flush_callback() {
    let copies = {
        let Ok(manager) = MANAGER.try_lock() else {
            return;
        };
        let mut copies: Vec<(String, u32, Vec<Entry>)> = manager
            .slots
            .iter()
            .flatten()
            .map(|state| (state.name.clone(), state.pid, state.ring.snapshot()))
            .collect();
        copies.extend(
            manager
                .exit_list
                .iter()
                .map(|node| (node.name.clone(), node.pid, node.ring.snapshot())),
        );
        copies
    };
    let root = trace_root();
    for (name, pid, entries) in &copies {
        let _ = persist(&root, name, *pid, entries);
    }
}

/// Hooks the tracer into crash handling: after a dump completes, every
/// journal is flushed while the process is still alive.
pub fn register_crash_flush() {
    npud_crashdump::register_crash_callback(crash_flush_callback);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Persistence tests rewrite the diagnostics root env var; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn destroy_and_reclaim(handle: TraceHandle) {
        destroy(handle).unwrap();
        reclaim();
    }

    #[test]
    fn create_get_submit_destroy() {
        let handle = create("lifecycle", TraceConfig::default()).unwrap();
        assert_eq!(get("lifecycle"), Some(handle));
        submit(handle, 7, b"hello").unwrap();
        destroy_and_reclaim(handle);
        assert_eq!(get("lifecycle"), None);
        assert!(matches!(
            submit(handle, 7, b"late"),
            Err(TraceError::InvalidHandle)
        ));
    }

    #[test]
    fn duplicate_active_name_is_refused() {
        let handle = create("dup", TraceConfig::default()).unwrap();
        assert!(matches!(
            create("dup", TraceConfig::default()),
            Err(TraceError::NameExists(_))
        ));
        destroy_and_reclaim(handle);
    }

    #[test]
    fn recreation_waits_for_reclaim() {
        let handle = create("phoenix", TraceConfig::default()).unwrap();
        destroy(handle).unwrap();
        assert!(matches!(
            create("phoenix", TraceConfig::default()),
            Err(TraceError::NamePendingReclaim(_))
        ));
        reclaim();
        let again = create("phoenix", TraceConfig::default()).unwrap();
        assert_ne!(again, handle);
        destroy_and_reclaim(again);
    }

    #[test]
    fn stale_handle_is_invalid_after_slot_reuse() {
        let first = create("stale-a", TraceConfig::default()).unwrap();
        destroy_and_reclaim(first);
        // Force reuse of some slot; even if it lands elsewhere, the old
        // generation must no longer resolve.
        let second = create("stale-b", TraceConfig::default()).unwrap();
        assert!(matches!(
            submit(first, 0, b""),
            Err(TraceError::InvalidHandle)
        ));
        destroy_and_reclaim(second);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let mut held = Vec::new();
        let mut exhausted = false;
        for i in 0..=MAX_TRACE_OBJECTS {
            match create(&format!("pool{i}"), TraceConfig::default()) {
                Ok(handle) => held.push(handle),
                Err(TraceError::PoolExhausted) => {
                    exhausted = true;
                    break;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(exhausted, "pool never filled");
        for handle in held {
            destroy_and_reclaim(handle);
        }
    }

    #[test]
    fn invalid_names_are_rejected() {
        for name in ["", "a/b", "../up", &"x".repeat(MAX_TRACE_NAME + 1)] {
            assert!(matches!(
                create(name, TraceConfig::default()),
                Err(TraceError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn save_writes_flat_and_structured_records() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("NPUD_DIAG_PATH", tmp.path());

        let empty = create("save-empty", TraceConfig::default()).unwrap();
        let full = create("save-full", TraceConfig::default()).unwrap();
        submit(full, 3, b"payload").unwrap();

        assert_eq!(save(Some(empty)).unwrap(), 1);
        assert_eq!(save(Some(full)).unwrap(), 1);

        let mut flat = None;
        let mut structured = None;
        for entry in std::fs::read_dir(tmp.path().join("trace")).unwrap() {
            let path = entry.unwrap().path();
            let json: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
            match json["name"].as_str().unwrap() {
                "save-empty" => flat = Some(json),
                "save-full" => structured = Some(json),
                _ => {}
            }
        }
        let flat = flat.expect("flat record");
        assert_eq!(flat["entries"], 0);
        assert!(flat.get("items").is_none());
        let structured = structured.expect("structured record");
        assert_eq!(structured["entries"], 1);
        assert_eq!(structured["items"][0]["kind"], 3);
        assert_eq!(structured["items"][0]["data"], "payload");

        std::env::remove_var("NPUD_DIAG_PATH");
        destroy_and_reclaim(empty);
        destroy_and_reclaim(full);
    }

    #[test]
    fn exit_list_replaces_same_named_entry_and_flushes() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("NPUD_DIAG_PATH", tmp.path());

        let config = TraceConfig {
            flush_on_exit: true,
            ..TraceConfig::default()
        };
        let first = create("exitful", config.clone()).unwrap();
        submit(first, 1, b"old contents").unwrap();
        destroy(first).unwrap();

        // Same name again: allowed (the old instance sits on the exit
        // list, not the delete list), and its destroy replaces the entry.
        let second = create("exitful", config).unwrap();
        submit(second, 2, b"new contents").unwrap();
        destroy(second).unwrap();

        assert_eq!(flush_at_exit().unwrap(), 1);
        let entries: Vec<_> = std::fs::read_dir(tmp.path().join("trace"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("exitful_")
            })
            .collect();
        assert_eq!(entries.len(), 1);
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&entries[0]).unwrap()).unwrap();
        assert_eq!(json["items"][0]["data"], "new contents");
        assert_eq!(json["items"][0]["kind"], 2);

        std::env::remove_var("NPUD_DIAG_PATH");
    }

    #[test]
    fn crash_flush_persists_active_journals() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("NPUD_DIAG_PATH", tmp.path());

        let handle = create("crashy", TraceConfig::default()).unwrap();
        submit(handle, 9, b"last words").unwrap();
        crash_flush_callback();

        let found = std::fs::read_dir(tmp.path().join("trace"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .any(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("crashy_")
            });
        assert!(found);

        std::env::remove_var("NPUD_DIAG_PATH");
        destroy_and_reclaim(handle);
    }
}
