//! Backpressure: ceilings on outstanding dependencies and the cooperating
//! background cleaner.
//!
//! Creators never fail for lack of resources. When a ceiling is exceeded
//! the creator requests cleanup — sets a flag, wakes the cleaner — and
//! pauses on a condvar bounded by the configured pause, so a stalled
//! cleaner costs latency, never progress. The cleaner flushes a batch of
//! dirty inode state or one directory with pending removals through the
//! collaborator traits, then wakes every paused creator.

use crate::SoftdepEngine;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PressureKind {
    InodeDeps,
    RemovalDeps,
}

#[derive(Debug, Default)]
pub(crate) struct Limits {
    /// Mirrors of the graph counters, readable without the engine lock.
    pub inodedeps: AtomicUsize,
    pub dirrems: AtomicUsize,
    pub req_inode_cleanup: AtomicBool,
    pub req_removal_cleanup: AtomicBool,
    pub sync: Mutex<()>,
    pub cleaner_cv: Condvar,
    pub waiter_cv: Condvar,
}

impl SoftdepEngine {
    /// Pause the caller if `kind` is over its ceiling, waking the cleaner
    /// and waiting (bounded) for it to retire something. One retry, then
    /// the caller proceeds regardless.
    pub(crate) fn throttle(&self, kind: PressureKind) {
        for _ in 0..2 {
            let (count, ceiling, flag) = match kind {
                PressureKind::InodeDeps => (
                    self.limits.inodedeps.load(Ordering::Acquire),
                    self.config.max_inode_deps,
                    &self.limits.req_inode_cleanup,
                ),
                PressureKind::RemovalDeps => (
                    self.limits.dirrems.load(Ordering::Acquire),
                    self.config.max_removal_deps,
                    &self.limits.req_removal_cleanup,
                ),
            };
            if count < ceiling {
                return;
            }
            tracing::warn!(
                target: "ordfs::limits",
                kind = ?kind,
                count,
                ceiling,
                "dependency ceiling reached, requesting cleanup"
            );
            flag.store(true, Ordering::Release);
            self.limits.cleaner_cv.notify_all();
            let mut guard = self.limits.sync.lock();
            let _ = self
                .limits
                .waiter_cv
                .wait_for(&mut guard, self.config.cleanup_pause);
        }
    }

    /// Flush the inode state backing one victim dependency so its records
    /// can retire. Runs on the cleaner.
    pub(crate) fn clear_inode_backlog(&self) {
        let victim = self.with_graph(|g| {
            g.inodedep_index.first().map(|(key, idp)| {
                let gate_buf = g
                    .inodedeps
                    .get(idp)
                    .gate
                    .map(|bm| g.bmsafemaps.get(bm).buf);
                (key.fs, key.ino, gate_buf)
            })
        });
        let Some((fs, ino, gate_buf)) = victim else {
            return;
        };
        tracing::debug!(target: "ordfs::limits", fs = fs.0, ino = ino.0, "clearing inode backlog");
        // The governing bitmap first, so the inode itself may be written.
        if let Some(buf) = gate_buf {
            if let Err(err) = self.cache.flush(buf) {
                self.diagnostic("clear_inode_backlog: bitmap flush", &err);
            }
            self.process_completions();
        }
        if let Err(err) = self.vfs.update_inode_on_disk(fs, ino) {
            self.diagnostic("clear_inode_backlog: inode update", &err);
        }
        self.process_completions();
        let _ = self.process_worklist(None);
    }

    /// Flush one directory with pending removal dependencies. Runs on the
    /// cleaner.
    pub(crate) fn clear_removal_backlog(&self) {
        let victim = self.with_graph(|g| {
            g.pagedeps
                .handles()
                .find(|&h| !g.pagedeps.get(h).removals.is_empty())
                .map(|h| {
                    let page = g.pagedeps.get(h);
                    (page.mount, page.ino)
                })
        });
        let Some((mount, ino)) = victim else {
            return;
        };
        tracing::debug!(
            target: "ordfs::limits",
            mount = mount.0,
            ino = ino.0,
            "clearing removal backlog"
        );
        if let Err(err) = self.vfs.sync_directory_page(mount, ino) {
            self.diagnostic("clear_removal_backlog: directory sync", &err);
        }
        self.process_completions();
        let _ = self.process_worklist(None);
    }
}
