//! Background triggers: debounced memory-file watching, session transcript
//! delta tracking, and the optional interval timer.
//!
//! Watcher callbacks run on the notify thread; they only forward events over
//! a channel. The tokio tasks draining those channels mark sources dirty and
//! request syncs through the manager — they never touch the store directly.
//! Syncs fired from here log failures and swallow them.

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::index::sync::{SyncOptions, SyncReason};
use crate::manager::MemoryManager;

/// Debounce window for session transcript events.
const SESSION_DEBOUNCE: Duration = Duration::from_secs(5);

/// Live watcher state owned by a manager. Dropping it stops everything.
pub(crate) struct WatchHandles {
    pub debouncers: Vec<Debouncer<RecommendedWatcher>>,
    pub tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl WatchHandles {
    pub fn stop(&mut self) {
        self.debouncers.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Start every configured background trigger for a manager.
pub(crate) fn start(manager: &MemoryManager) -> WatchHandles {
    let mut handles = WatchHandles {
        debouncers: Vec::new(),
        tasks: Vec::new(),
    };

    let cfg = manager.config();

    if cfg.sync.watch {
        match start_memory_watch(manager) {
            Ok((debouncer, task)) => {
                handles.debouncers.push(debouncer);
                handles.tasks.push(task);
            }
            Err(err) => warn!(error = %format!("{err:#}"), "memory watcher not started"),
        }
        match start_session_watch(manager) {
            Ok(Some((debouncer, task))) => {
                handles.debouncers.push(debouncer);
                handles.tasks.push(task);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %format!("{err:#}"), "session watcher not started"),
        }
    }

    if cfg.sync.interval_minutes > 0 {
        handles.tasks.push(start_interval(manager));
    }

    handles
}

/// Watch the workspace memory layout with the configured debounce. Any
/// add/change/remove of a Markdown file marks memory dirty and syncs.
fn start_memory_watch(
    manager: &MemoryManager,
) -> anyhow::Result<(Debouncer<RecommendedWatcher>, tokio::task::JoinHandle<()>)> {
    let cfg = manager.config();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

    let mut debouncer = new_debouncer(
        Duration::from_millis(cfg.sync.watch_debounce_ms.max(50)),
        move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
            Ok(events) => {
                let md_paths: Vec<PathBuf> = events
                    .into_iter()
                    .map(|e| e.path)
                    .filter(|p| is_markdown(p))
                    .collect();
                if !md_paths.is_empty() {
                    let _ = tx.send(md_paths);
                }
            }
            Err(error) => warn!(%error, "memory watch error"),
        },
    )?;

    let workspace = manager.workspace().to_path_buf();
    debouncer
        .watcher()
        .watch(&workspace, RecursiveMode::NonRecursive)?;
    let memory_dir = workspace.join("memory");
    if memory_dir.is_dir() {
        debouncer
            .watcher()
            .watch(&memory_dir, RecursiveMode::Recursive)?;
    }
    for raw in &cfg.sources.extra_paths {
        let path = crate::config::expand_tilde(raw);
        if std::fs::symlink_metadata(&path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(true)
        {
            continue;
        }
        let mode = if path.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(err) = debouncer.watcher().watch(&path, mode) {
            warn!(path = %path.display(), %err, "extra path not watched");
        }
    }

    let manager = manager.clone();
    let task = tokio::spawn(async move {
        while let Some(paths) = rx.recv().await {
            debug!(changed = paths.len(), "memory files changed");
            manager.mark_memory_dirty();
            manager
                .sync_and_log(SyncOptions {
                    reason: SyncReason::Watch,
                    force: false,
                })
                .await;
        }
    });

    Ok((debouncer, task))
}

/// Watch the sessions directory with a fixed 5 s debounce, feeding observed
/// sizes through the per-file delta tracker.
fn start_session_watch(
    manager: &MemoryManager,
) -> anyhow::Result<Option<(Debouncer<RecommendedWatcher>, tokio::task::JoinHandle<()>)>> {
    let sessions_dir = manager.sessions_dir().to_path_buf();
    if !sessions_dir.is_dir() {
        return Ok(None);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
    let mut debouncer = new_debouncer(
        SESSION_DEBOUNCE,
        move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
            Ok(events) => {
                let transcripts: Vec<PathBuf> = events
                    .into_iter()
                    .map(|e| e.path)
                    .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
                    .collect();
                if !transcripts.is_empty() {
                    let _ = tx.send(transcripts);
                }
            }
            Err(error) => warn!(%error, "session watch error"),
        },
    )?;
    debouncer
        .watcher()
        .watch(&sessions_dir, RecursiveMode::NonRecursive)?;

    let manager = manager.clone();
    let task = tokio::spawn(async move {
        while let Some(paths) = rx.recv().await {
            let mut any_dirty = false;
            for path in paths {
                if manager.note_session_growth(&path) {
                    any_dirty = true;
                }
            }
            if any_dirty {
                manager
                    .sync_and_log(SyncOptions {
                        reason: SyncReason::SessionDelta,
                        force: false,
                    })
                    .await;
            }
        }
    });

    Ok(Some((debouncer, task)))
}

fn start_interval(manager: &MemoryManager) -> tokio::task::JoinHandle<()> {
    let minutes = manager.config().sync.interval_minutes;
    let manager = manager.clone();
    tokio::spawn(async move {
        let period = Duration::from_secs(minutes * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            manager
                .sync_and_log(SyncOptions {
                    reason: SyncReason::Interval,
                    force: false,
                })
                .await;
        }
    })
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

/// Count newlines in the byte range `[from, to)` of a file. Used to turn
/// transcript growth into an appended-message estimate without re-reading
/// the whole file.
pub(crate) fn count_newlines_in_range(path: &Path, from: u64, to: u64) -> u64 {
    if to <= from {
        return 0;
    }
    let Ok(mut file) = std::fs::File::open(path) else {
        return 0;
    };
    if file.seek(SeekFrom::Start(from)).is_err() {
        return 0;
    }
    let mut remaining = to - from;
    let mut buf = [0u8; 64 * 1024];
    let mut count = 0u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        match file.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => {
                count += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
                remaining -= n as u64;
            }
            Err(_) => break,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_filter() {
        assert!(is_markdown(Path::new("/ws/MEMORY.md")));
        assert!(is_markdown(Path::new("/ws/notes.MD")));
        assert!(!is_markdown(Path::new("/ws/session.jsonl")));
        assert!(!is_markdown(Path::new("/ws/plain")));
    }

    #[test]
    fn newline_counting_over_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, b"one\ntwo\nthree\n").unwrap();

        assert_eq!(count_newlines_in_range(&path, 0, 14), 3);
        // Range starting after the first line's newline.
        assert_eq!(count_newlines_in_range(&path, 4, 14), 2);
        assert_eq!(count_newlines_in_range(&path, 10, 10), 0);
        assert_eq!(count_newlines_in_range(Path::new("/nope"), 0, 5), 0);
    }
}
