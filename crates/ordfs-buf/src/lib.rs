#![forbid(unsafe_code)]
//! Buffer-cache collaborator contract and an in-memory implementation.
//!
//! The dependency engine never owns buffers; it owns *ordering records*
//! attached to them. The cache owns the bytes and the dirty state, and it
//! brackets every metadata write with the two installed hooks:
//!
//! 1. [`WriteHooks::write_initiate`] — called with the buffer bytes just
//!    before they are copied to the device, so the engine can roll them back
//!    to the last safe state;
//! 2. [`WriteHooks::write_complete`] — called after the device acknowledges
//!    the write, so the engine can roll the buffer forward and retire
//!    satisfied records.
//!
//! Lock order: a cache always takes its own buffer lock before invoking a
//! hook, and the engine takes its graph lock inside the hook. The engine
//! therefore never calls back into [`BufferCache`] while holding its graph
//! lock.
//!
//! [`MemBufCache`] is a real, self-contained cache: buffers are backed by a
//! flat "disk" image keyed by physical block number, writes are atomic whole
//! buffers, and write failures can be injected per buffer to exercise the
//! error path.

use ordfs_error::{OrdfsError, Result};
use ordfs_types::{BlockNo, BufId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Hooks installed by the dependency engine around every metadata write.
pub trait WriteHooks: Send + Sync {
    /// Called with the buffer's bytes immediately before a device write.
    /// The implementation may rewrite the bytes in place (rollback).
    fn write_initiate(&self, buf: BufId, bytes: &mut Vec<u8>);

    /// Called after the device has acknowledged the write.
    fn write_complete(&self, buf: BufId);

    /// Called when a write failed; the buffer keeps its rolled-back bytes
    /// and stays dirty.
    fn write_error(&self, buf: BufId, error: &OrdfsError);

    /// Called when the cache discards a buffer. A buffer that still carries
    /// dependencies must not be discarded; the implementation aborts if it
    /// does.
    fn deallocate(&self, buf: BufId);
}

/// Engine-facing contract of the buffer cache.
pub trait BufferCache: Send + Sync {
    /// Run `f` over the buffer's bytes. Returns `NotFound` for a dead id.
    fn with_buffer_mut(&self, buf: BufId, f: &mut dyn FnMut(&mut Vec<u8>)) -> Result<()>;

    /// Mark a buffer dirty so it will be written again.
    fn mark_dirty(&self, buf: BufId) -> Result<()>;

    /// Read the *durable* content of a physical block (zeros if never
    /// written).
    fn read_disk_block(&self, block: BlockNo) -> Result<Vec<u8>>;

    /// Identities of all dirty buffers, in ascending id order.
    fn dirty_buffers(&self) -> Vec<BufId>;

    /// Write the buffer through the full pipeline (initiation hook, device
    /// copy, completion hook).
    fn flush(&self, buf: BufId) -> Result<()>;

    /// The engine attached the first / detached the last dependency record.
    fn note_attach(&self, buf: BufId);
    fn note_detach(&self, buf: BufId);
}

#[derive(Debug)]
struct MemBuffer {
    bytes: Vec<u8>,
    disk_block: BlockNo,
    dirty: bool,
    fail_next_write: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    bufs: HashMap<BufId, MemBuffer>,
    disk: HashMap<BlockNo, Vec<u8>>,
    next_id: u64,
}

/// In-memory buffer cache with a backing disk image.
pub struct MemBufCache {
    block_size: u32,
    state: Mutex<CacheState>,
    hooks: Mutex<Option<Arc<dyn WriteHooks>>>,
    /// Per-buffer dependency marker counts; independent lock, never held
    /// across calls into anything else.
    markers: Mutex<HashMap<BufId, usize>>,
}

impl std::fmt::Debug for MemBufCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemBufCache")
            .field("block_size", &self.block_size)
            .field("buffers", &state.bufs.len())
            .field("disk_blocks", &state.disk.len())
            .finish()
    }
}

impl MemBufCache {
    #[must_use]
    pub fn new(block_size: u32) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            state: Mutex::new(CacheState::default()),
            hooks: Mutex::new(None),
            markers: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Install the engine's write hooks. Must happen before the first flush.
    pub fn install_hooks(&self, hooks: Arc<dyn WriteHooks>) {
        *self.hooks.lock() = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn WriteHooks>> {
        self.hooks.lock().clone()
    }

    /// Create a zero-filled buffer backed by physical block `disk_block`.
    pub fn create_buffer(&self, disk_block: BlockNo) -> BufId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = BufId(state.next_id);
        let len = self.block_size as usize;
        let bytes = state
            .disk
            .get(&disk_block)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; len]);
        state.bufs.insert(
            id,
            MemBuffer {
                bytes,
                disk_block,
                dirty: false,
                fail_next_write: false,
            },
        );
        id
    }

    /// Snapshot of the buffer's in-memory bytes.
    pub fn buffer(&self, buf: BufId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state
            .bufs
            .get(&buf)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| OrdfsError::NotFound(format!("buffer {buf}")))
    }

    /// Snapshot of a physical block's durable content, if ever written.
    #[must_use]
    pub fn disk_image(&self, block: BlockNo) -> Option<Vec<u8>> {
        self.state.lock().disk.get(&block).cloned()
    }

    #[must_use]
    pub fn is_dirty(&self, buf: BufId) -> bool {
        self.state
            .lock()
            .bufs
            .get(&buf)
            .is_some_and(|b| b.dirty)
    }

    /// Arrange for the next flush of `buf` to fail with an I/O error.
    pub fn fail_next_write(&self, buf: BufId) {
        if let Some(b) = self.state.lock().bufs.get_mut(&buf) {
            b.fail_next_write = true;
        }
    }

    /// Number of dependency markers the engine has attached to `buf`.
    #[must_use]
    pub fn marker_count(&self, buf: BufId) -> usize {
        self.markers.lock().get(&buf).copied().unwrap_or(0)
    }

    /// Write the buffer through the full pipeline: initiation hook, device
    /// copy, completion hook. On injected failure the device copy is
    /// skipped, the error hook runs, and the buffer stays dirty.
    fn flush_impl(&self, buf: BufId) -> Result<()> {
        let hooks = self.hooks();
        let mut state = self.state.lock();
        let mem = state
            .bufs
            .get_mut(&buf)
            .ok_or_else(|| OrdfsError::NotFound(format!("buffer {buf}")))?;

        if let Some(h) = hooks.as_deref() {
            h.write_initiate(buf, &mut mem.bytes);
        }

        if mem.fail_next_write {
            mem.fail_next_write = false;
            drop(state);
            let err = OrdfsError::Io(std::io::Error::other("injected write failure"));
            tracing::warn!(target: "ordfs::buf", buf = buf.0, "write_failed");
            if let Some(h) = hooks.as_deref() {
                h.write_error(buf, &err);
            }
            return Err(err);
        }

        let image = mem.bytes.clone();
        let block = mem.disk_block;
        mem.dirty = false;
        state.disk.insert(block, image);
        drop(state);

        tracing::trace!(target: "ordfs::buf", buf = buf.0, block = block.0, "write_durable");
        if let Some(h) = hooks.as_deref() {
            h.write_complete(buf);
        }
        Ok(())
    }

    /// Discard a buffer. The deallocate hook runs first so the engine can
    /// abort if the buffer still carries dependencies.
    pub fn release_buffer(&self, buf: BufId) -> Result<()> {
        if let Some(h) = self.hooks() {
            h.deallocate(buf);
        }
        let mut state = self.state.lock();
        state
            .bufs
            .remove(&buf)
            .ok_or_else(|| OrdfsError::NotFound(format!("buffer {buf}")))?;
        Ok(())
    }
}

impl BufferCache for MemBufCache {
    fn with_buffer_mut(&self, buf: BufId, f: &mut dyn FnMut(&mut Vec<u8>)) -> Result<()> {
        let mut state = self.state.lock();
        let mem = state
            .bufs
            .get_mut(&buf)
            .ok_or_else(|| OrdfsError::NotFound(format!("buffer {buf}")))?;
        f(&mut mem.bytes);
        Ok(())
    }

    fn mark_dirty(&self, buf: BufId) -> Result<()> {
        let mut state = self.state.lock();
        let mem = state
            .bufs
            .get_mut(&buf)
            .ok_or_else(|| OrdfsError::NotFound(format!("buffer {buf}")))?;
        mem.dirty = true;
        Ok(())
    }

    fn read_disk_block(&self, block: BlockNo) -> Result<Vec<u8>> {
        let state = self.state.lock();
        Ok(state
            .disk
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; self.block_size as usize]))
    }

    fn flush(&self, buf: BufId) -> Result<()> {
        self.flush_impl(buf)
    }

    fn dirty_buffers(&self) -> Vec<BufId> {
        let state = self.state.lock();
        let mut ids: Vec<BufId> = state
            .bufs
            .iter()
            .filter(|(_, b)| b.dirty)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn note_attach(&self, buf: BufId) {
        *self.markers.lock().entry(buf).or_insert(0) += 1;
    }

    fn note_detach(&self, buf: BufId) {
        let mut markers = self.markers.lock();
        match markers.get_mut(&buf) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                markers.remove(&buf);
            }
            None => panic!("dependency marker underflow on buffer {buf}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHooks {
        initiated: AtomicUsize,
        completed: AtomicUsize,
        errored: AtomicUsize,
    }

    impl WriteHooks for CountingHooks {
        fn write_initiate(&self, _buf: BufId, bytes: &mut Vec<u8>) {
            self.initiated.fetch_add(1, Ordering::SeqCst);
            // Simulate a rollback: blank the first byte.
            if let Some(b) = bytes.first_mut() {
                *b = 0;
            }
        }

        fn write_complete(&self, _buf: BufId) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn write_error(&self, _buf: BufId, _error: &OrdfsError) {
            self.errored.fetch_add(1, Ordering::SeqCst);
        }

        fn deallocate(&self, _buf: BufId) {}
    }

    #[test]
    fn flush_runs_hooks_and_persists_rolled_back_image() {
        let cache = MemBufCache::new(512);
        let hooks = Arc::new(CountingHooks::default());
        cache.install_hooks(hooks.clone());

        let buf = cache.create_buffer(BlockNo(9));
        cache
            .with_buffer_mut(buf, &mut |bytes| bytes[0] = 0xAA)
            .expect("mutate");
        cache.mark_dirty(buf).expect("dirty");
        cache.flush(buf).expect("flush");

        assert_eq!(hooks.initiated.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.completed.load(Ordering::SeqCst), 1);
        // The rolled-back image (first byte zeroed) is what became durable.
        let disk = cache.disk_image(BlockNo(9)).expect("disk image");
        assert_eq!(disk[0], 0);
        assert!(!cache.is_dirty(buf));
    }

    #[test]
    fn injected_failure_keeps_buffer_dirty_and_reports() {
        let cache = MemBufCache::new(512);
        let hooks = Arc::new(CountingHooks::default());
        cache.install_hooks(hooks.clone());

        let buf = cache.create_buffer(BlockNo(3));
        cache.mark_dirty(buf).expect("dirty");
        cache.fail_next_write(buf);
        assert!(cache.flush(buf).is_err());
        assert_eq!(hooks.errored.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.completed.load(Ordering::SeqCst), 0);
        assert!(cache.is_dirty(buf));
        assert!(cache.disk_image(BlockNo(3)).is_none());
    }

    #[test]
    fn new_buffer_sees_durable_content() {
        let cache = MemBufCache::new(512);
        let buf = cache.create_buffer(BlockNo(4));
        cache
            .with_buffer_mut(buf, &mut |bytes| bytes[10] = 7)
            .expect("mutate");
        cache.mark_dirty(buf).expect("dirty");
        cache.flush(buf).expect("flush");
        cache.release_buffer(buf).expect("release");

        let again = cache.create_buffer(BlockNo(4));
        assert_eq!(cache.buffer(again).expect("bytes")[10], 7);
    }

    #[test]
    fn dirty_buffers_sorted() {
        let cache = MemBufCache::new(512);
        let a = cache.create_buffer(BlockNo(1));
        let b = cache.create_buffer(BlockNo(2));
        cache.mark_dirty(b).expect("dirty");
        cache.mark_dirty(a).expect("dirty");
        assert_eq!(cache.dirty_buffers(), vec![a, b]);
    }

    #[test]
    fn attach_markers_balance() {
        let cache = MemBufCache::new(512);
        let buf = cache.create_buffer(BlockNo(1));
        cache.note_attach(buf);
        cache.note_attach(buf);
        assert_eq!(cache.marker_count(buf), 2);
        cache.note_detach(buf);
        cache.note_detach(buf);
        assert_eq!(cache.marker_count(buf), 0);
    }

    #[test]
    #[should_panic(expected = "marker underflow")]
    fn detach_without_attach_panics() {
        let cache = MemBufCache::new(512);
        let buf = cache.create_buffer(BlockNo(1));
        cache.note_detach(buf);
    }

    #[test]
    fn read_disk_block_defaults_to_zeros() {
        let cache = MemBufCache::new(128);
        let zeros = cache.read_disk_block(BlockNo(77)).expect("read");
        assert_eq!(zeros, vec![0_u8; 128]);
    }
}
