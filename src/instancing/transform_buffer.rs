//! Per-prototype transform buffers.
//!
//! Each bound prototype owns one buffer of world matrices that the draw path
//! reads from `start_index`. Buffers only grow; growing allocates a new
//! buffer, copies the live matrices over and rebinds the render key, so the
//! old buffer is never resized under a reader. Reads of the matrices go
//! through tickets owned here, which is what lets a resize finish every
//! outstanding read of the old buffer first.

use std::collections::{HashMap, HashSet};

use glam::Mat4;

use crate::backend::{BufferId, BufferUsage, MATRIX_SIZE, ReadbackQueue, RenderBackend, RenderKey};
use crate::config::BufferConfig;
use crate::core::{Error, Result};

/// Receives the matrices of one read. The slice only lives for the call.
pub type MatrixCallback = Box<dyn FnOnce(Result<&[Mat4]>)>;

/// Buffer bookkeeping for one render key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformBufferEntry {
    pub buffer: BufferId,
    pub start_index: u32,
    /// Matrices the buffer can hold past `start_index`
    pub capacity: u32,
    /// Matrices the draw system renders; never above `capacity`
    pub instance_count: u32,
}

/// Owns the transform buffers of one manager.
pub struct TransformBufferManager {
    config: BufferConfig,
    entries: HashMap<RenderKey, TransformBufferEntry>,
    stale_light_probes: HashSet<RenderKey>,
    readbacks: ReadbackQueue<MatrixCallback>,
}

fn deliver(callback: MatrixCallback, result: Result<Vec<u8>>) {
    match result {
        Ok(bytes) => {
            let matrices: Vec<Mat4> = bytemuck::pod_collect_to_vec(&bytes);
            callback(Ok(&matrices));
        }
        Err(e) => callback(Err(e)),
    }
}

impl TransformBufferManager {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            stale_light_probes: HashSet::new(),
            readbacks: ReadbackQueue::new(),
        }
    }

    pub fn entry(&self, key: RenderKey) -> Option<TransformBufferEntry> {
        self.entries.get(&key).copied()
    }

    pub fn instance_count(&self, key: RenderKey) -> u32 {
        self.entries.get(&key).map_or(0, |e| e.instance_count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn capacity_for(&self, required: u32) -> u32 {
        let target = required.max(self.config.min_capacity).max(1);
        if self.config.grow_pow2 {
            target.checked_next_power_of_two().unwrap_or(target)
        } else {
            target
        }
    }

    /// Make the buffer of `key` hold at least `required` matrices, creating
    /// it on first use. Never shrinks.
    pub fn ensure_capacity(
        &mut self,
        backend: &mut dyn RenderBackend,
        key: RenderKey,
        required: u32,
    ) -> Result<TransformBufferEntry> {
        if key.is_none() {
            return Err(Error::InvalidHandle { kind: "render key" });
        }
        let old = self.entries.get(&key).copied();
        if let Some(entry) = old {
            if entry.capacity >= required {
                return Ok(entry);
            }
        }

        let capacity = self.capacity_for(required);
        let start_index = old.map_or(0, |e| e.start_index);
        let size = (start_index as u64 + capacity as u64) * MATRIX_SIZE;
        let buffer = backend.create_buffer(&format!("transforms {key}"), BufferUsage::Transforms, size);

        let mut instance_count = 0;
        if let Some(old) = old {
            self.complete_pending_requests(backend, key);
            let live = (old.start_index as u64 + old.instance_count as u64) * MATRIX_SIZE;
            if live > 0 {
                if let Err(e) = backend.copy_buffer(old.buffer, buffer, live) {
                    backend.release_buffer(buffer);
                    return Err(e);
                }
            }
            backend.release_buffer(old.buffer);
            instance_count = old.instance_count;
            log::debug!("Grew transform buffer of {key}: {} -> {capacity}", old.capacity);
        }

        if let Err(e) = backend.bind_transform_buffer(key, buffer, start_index) {
            backend.release_buffer(buffer);
            return Err(e);
        }
        let entry = TransformBufferEntry {
            buffer,
            start_index,
            capacity,
            instance_count,
        };
        self.entries.insert(key, entry);
        Ok(entry)
    }

    /// Forward the live instance count to the draw system.
    pub fn set_instance_count(&mut self, backend: &mut dyn RenderBackend, key: RenderKey, count: u32) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(Error::InvalidHandle { kind: "render key" })?;
        if count > entry.capacity {
            return Err(Error::Capacity {
                required: count,
                capacity: entry.capacity,
            });
        }
        entry.instance_count = count;
        backend.set_buffer_size(key, count)
    }

    /// Drop the buffer of `key` after delivering its outstanding reads.
    pub fn release(&mut self, backend: &mut dyn RenderBackend, key: RenderKey) {
        if !self.entries.contains_key(&key) {
            return;
        }
        self.complete_pending_requests(backend, key);
        if let Some(entry) = self.entries.remove(&key) {
            backend.release_buffer(entry.buffer);
        }
        self.stale_light_probes.remove(&key);
    }

    pub fn release_all(&mut self, backend: &mut dyn RenderBackend) {
        for (callback, result) in self.readbacks.complete_all(backend) {
            deliver(callback, result);
        }
        for (_, entry) in self.entries.drain() {
            backend.release_buffer(entry.buffer);
        }
        self.stale_light_probes.clear();
    }

    /// Read the live matrices of `key` asynchronously. Delivered by
    /// `poll_readbacks` or `complete_pending_requests`.
    pub fn request_matrices_async(
        &mut self,
        backend: &mut dyn RenderBackend,
        key: RenderKey,
        callback: impl FnOnce(Result<&[Mat4]>) + 'static,
    ) -> Result<()> {
        let entry = self.entry(key).ok_or(Error::InvalidHandle { kind: "render key" })?;
        if entry.instance_count == 0 {
            callback(Ok(&[]));
            return Ok(());
        }
        self.readbacks.submit(
            backend,
            entry.buffer,
            entry.start_index as u64 * MATRIX_SIZE,
            entry.instance_count as u64 * MATRIX_SIZE,
            Box::new(callback),
        )
    }

    /// Deliver every completed read. Returns how many callbacks ran.
    pub fn poll_readbacks(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let done = self.readbacks.poll(backend);
        let n = done.len();
        for (callback, result) in done {
            deliver(callback, result);
        }
        n
    }

    /// Block until every read of `key`'s buffer is delivered.
    pub fn complete_pending_requests(&mut self, backend: &mut dyn RenderBackend, key: RenderKey) -> usize {
        let Some(entry) = self.entries.get(&key) else {
            return 0;
        };
        let done = self.readbacks.complete_for(backend, entry.buffer);
        let n = done.len();
        for (callback, result) in done {
            deliver(callback, result);
        }
        n
    }

    pub fn pending_reads(&self) -> usize {
        self.readbacks.len()
    }

    pub fn mark_light_probes_stale(&mut self, key: RenderKey) {
        if self.entries.contains_key(&key) {
            self.stale_light_probes.insert(key);
        }
    }

    /// True once per staleness notification
    pub fn take_light_probes_stale(&mut self, key: RenderKey) -> bool {
        self.stale_light_probes.remove(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MeshAsset;
    use crate::backend::HostBackend;
    use crate::prototype::{InstanceProfile, Prototype, PrototypeDescriptor};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn setup() -> (HostBackend, RenderKey) {
        let mut backend = HostBackend::new();
        let mesh = Arc::new(MeshAsset::new("m"));
        let proto = Prototype::new(PrototypeDescriptor::from_mesh(&mesh, &[]), InstanceProfile::default());
        let key = backend.register_render_source(&proto).unwrap();
        (backend, key)
    }

    #[test]
    fn test_min_capacity_and_pow2_growth() {
        let (mut backend, key) = setup();
        let mut mgr = TransformBufferManager::new(BufferConfig::default());

        let e = mgr.ensure_capacity(&mut backend, key, 0).unwrap();
        assert_eq!(e.capacity, 1);
        assert_eq!(backend.transform_buffer(key), Some(e.buffer));

        let grown = mgr.ensure_capacity(&mut backend, key, 5).unwrap();
        assert_eq!(grown.capacity, 8);
        assert_ne!(grown.buffer, e.buffer);
        assert!(backend.buffer_size(e.buffer).is_none());
        assert_eq!(backend.transform_buffer(key), Some(grown.buffer));

        // Never shrinks
        let same = mgr.ensure_capacity(&mut backend, key, 2).unwrap();
        assert_eq!(same, grown);
    }

    #[test]
    fn test_growth_keeps_live_matrices() {
        let (mut backend, key) = setup();
        let mut mgr = TransformBufferManager::new(BufferConfig::default());
        let e = mgr.ensure_capacity(&mut backend, key, 2).unwrap();
        let m = Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        backend.write_buffer(e.buffer, 0, bytemuck::bytes_of(&m)).unwrap();
        mgr.set_instance_count(&mut backend, key, 1).unwrap();

        let grown = mgr.ensure_capacity(&mut backend, key, 100).unwrap();
        assert_eq!(grown.instance_count, 1);
        assert_eq!(backend.read_matrices(grown.buffer, 0, 1).unwrap(), vec![m]);
    }

    #[test]
    fn test_failed_growth_releases_new_buffer() {
        let (mut backend, key) = setup();
        let mut mgr = TransformBufferManager::new(BufferConfig::default());
        let e = mgr.ensure_capacity(&mut backend, key, 1).unwrap();
        mgr.set_instance_count(&mut backend, key, 1).unwrap();

        // Old contents can no longer be copied
        backend.release_buffer(e.buffer);
        assert!(mgr.ensure_capacity(&mut backend, key, 4).is_err());
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(mgr.entry(key), Some(e));
    }

    #[test]
    fn test_set_instance_count_bounded() {
        let (mut backend, key) = setup();
        let mut mgr = TransformBufferManager::new(BufferConfig::default());
        mgr.ensure_capacity(&mut backend, key, 4).unwrap();
        assert!(mgr.set_instance_count(&mut backend, key, 4).is_ok());
        assert_eq!(backend.instance_count(key), Some(4));
        assert!(matches!(
            mgr.set_instance_count(&mut backend, key, 5),
            Err(Error::Capacity { required: 5, capacity: 4 })
        ));
    }

    #[test]
    fn test_growth_completes_pending_reads() {
        let (mut backend, key) = setup();
        let mut mgr = TransformBufferManager::new(BufferConfig::default());
        let e = mgr.ensure_capacity(&mut backend, key, 1).unwrap();
        let m = Mat4::from_scale(glam::Vec3::splat(2.0));
        backend.write_buffer(e.buffer, 0, bytemuck::bytes_of(&m)).unwrap();
        mgr.set_instance_count(&mut backend, key, 1).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        mgr.request_matrices_async(&mut backend, key, move |r| sink.borrow_mut().extend_from_slice(r.unwrap()))
            .unwrap();
        assert_eq!(mgr.pending_reads(), 1);

        mgr.ensure_capacity(&mut backend, key, 16).unwrap();
        assert_eq!(mgr.pending_reads(), 0);
        assert_eq!(*seen.borrow(), vec![m]);
    }

    #[test]
    fn test_poll_readbacks_async() {
        let (mut backend, key) = setup();
        let mut mgr = TransformBufferManager::new(BufferConfig::default());
        mgr.ensure_capacity(&mut backend, key, 2).unwrap();
        mgr.set_instance_count(&mut backend, key, 2).unwrap();

        let count = Rc::new(RefCell::new(None));
        let sink = count.clone();
        mgr.request_matrices_async(&mut backend, key, move |r| *sink.borrow_mut() = Some(r.unwrap().len()))
            .unwrap();
        assert_eq!(mgr.poll_readbacks(&mut backend), 0);
        assert_eq!(mgr.poll_readbacks(&mut backend), 1);
        assert_eq!(*count.borrow(), Some(2));
    }

    #[test]
    fn test_empty_read_is_immediate() {
        let (mut backend, key) = setup();
        let mut mgr = TransformBufferManager::new(BufferConfig::default());
        mgr.ensure_capacity(&mut backend, key, 0).unwrap();
        let called = Rc::new(RefCell::new(false));
        let sink = called.clone();
        mgr.request_matrices_async(&mut backend, key, move |r| {
            assert!(r.unwrap().is_empty());
            *sink.borrow_mut() = true;
        })
        .unwrap();
        assert!(*called.borrow());
        assert_eq!(mgr.pending_reads(), 0);
    }

    #[test]
    fn test_release_and_light_probes() {
        let (mut backend, key) = setup();
        let mut mgr = TransformBufferManager::new(BufferConfig::default());
        mgr.ensure_capacity(&mut backend, key, 1).unwrap();
        mgr.mark_light_probes_stale(key);
        assert!(mgr.take_light_probes_stale(key));
        assert!(!mgr.take_light_probes_stale(key));

        mgr.mark_light_probes_stale(key);
        mgr.release(&mut backend, key);
        assert!(mgr.entry(key).is_none());
        assert!(!mgr.take_light_probes_stale(key));
        assert_eq!(backend.live_buffers(), 0);
        assert!(mgr.ensure_capacity(&mut backend, RenderKey::NONE, 1).is_err());
    }
}
