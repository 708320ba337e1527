//! CPU backend.
//!
//! Runs every kernel body from `kernel` on the host, data-parallel through
//! rayon. Instance slots in the tree kernel come from an atomic counter the
//! same way the GPU version takes them, so instance order inside a segment
//! varies from run to run.
//!
//! Readbacks snapshot the buffer at request time and become visible on the
//! second poll, which mimics a one-frame GPU latency.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::Mat4;
use rayon::prelude::*;

use super::handle::{BufferId, HandleTable, ReadbackId, RenderKey, TextureId};
use super::kernel::{self, Dispatch};
use super::{BufferUsage, MATRIX_SIZE, RenderBackend, TextureFormat};
use crate::core::{Error, Result};
use crate::prototype::Prototype;
use crate::terrain::TreeInstanceRecord;

struct HostBuffer {
    label: String,
    usage: BufferUsage,
    data: Vec<u8>,
}

struct HostTexture {
    label: String,
    format: TextureFormat,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// What the draw system knows about a registered prototype.
#[derive(Clone, Debug)]
pub struct HostRenderSource {
    pub name: String,
    pub instance_count: u32,
    pub transform_buffer: Option<BufferId>,
    pub start_index: u32,
}

struct HostRead {
    data: Vec<u8>,
    polls_left: u32,
}

/// Counters for tests and benches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub dispatches: u64,
    pub buffers_created: u64,
    pub textures_created: u64,
    pub reads_requested: u64,
}

/// Host reference backend.
pub struct HostBackend {
    sources: HandleTable<HostRenderSource>,
    buffers: HandleTable<HostBuffer>,
    textures: HandleTable<HostTexture>,
    reads: HandleTable<HostRead>,
    stats: HostStats,
}

fn le_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn le_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            sources: HandleTable::new(),
            buffers: HandleTable::new(),
            textures: HandleTable::new(),
            reads: HandleTable::new(),
            stats: HostStats::default(),
        }
    }

    pub fn stats(&self) -> HostStats {
        self.stats
    }

    /// Live buffer count (leak checks in tests)
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn render_source(&self, key: RenderKey) -> Option<&HostRenderSource> {
        key.handle().and_then(|h| self.sources.get(h))
    }

    pub fn buffer_label(&self, id: BufferId) -> Option<&str> {
        self.buffers.get(id.0).map(|b| b.label.as_str())
    }

    pub fn buffer_usage(&self, id: BufferId) -> Option<BufferUsage> {
        self.buffers.get(id.0).map(|b| b.usage)
    }

    pub fn texture_label(&self, id: TextureId) -> Option<&str> {
        self.textures.get(id.0).map(|t| t.label.as_str())
    }

    /// Matrices `[start, start + count)` of a transform buffer, read synchronously.
    pub fn read_matrices(&self, id: BufferId, start: u32, count: u32) -> Result<Vec<Mat4>> {
        let buf = self.buffer(id)?;
        let begin = start as usize * MATRIX_SIZE as usize;
        let end = begin + count as usize * MATRIX_SIZE as usize;
        let bytes = buf.data.get(begin..end).ok_or_else(|| {
            Error::Readback(format!("matrix range {start}+{count} outside buffer '{}'", buf.label))
        })?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    fn buffer(&self, id: BufferId) -> Result<&HostBuffer> {
        self.buffers.get(id.0).ok_or(Error::InvalidHandle { kind: "buffer" })
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut HostBuffer> {
        self.buffers.get_mut(id.0).ok_or(Error::InvalidHandle { kind: "buffer" })
    }

    fn texture(&self, id: TextureId) -> Result<&HostTexture> {
        self.textures.get(id.0).ok_or(Error::InvalidHandle { kind: "texture" })
    }

    fn source_mut(&mut self, key: RenderKey) -> Result<&mut HostRenderSource> {
        key.handle()
            .and_then(|h| self.sources.get_mut(h))
            .ok_or(Error::InvalidHandle { kind: "render key" })
    }

    /// Float texels of an optional texture and its width; empty when absent.
    fn float_texels(&self, id: Option<TextureId>) -> Result<Vec<f32>> {
        match id {
            Some(id) => Ok(le_f32s(&self.texture(id)?.data)),
            None => Ok(Vec::new()),
        }
    }

    fn run_capture(
        &mut self,
        kernel: kernel::CaptureKernel,
        params: &kernel::DetailCaptureParams,
        source: BufferId,
        holes: Option<TextureId>,
        target: TextureId,
    ) -> Result<()> {
        let raw = le_u32s(&self.buffer(source)?.data);
        let holes = self.float_texels(holes)?;
        let res = params.resolution;

        let texels: Vec<u8> = (0..res * res)
            .into_par_iter()
            .map(|i| {
                let value = raw.get(i as usize).copied().unwrap_or(0);
                kernel::capture_texel(kernel, params, value, &holes, i % res, i / res)
            })
            .collect();

        let tex = self
            .textures
            .get_mut(target.0)
            .ok_or(Error::InvalidHandle { kind: "texture" })?;
        let n = texels.len().min(tex.data.len());
        tex.data[..n].copy_from_slice(&texels[..n]);
        Ok(())
    }

    fn run_paint(
        &mut self,
        kernel: kernel::PaintKernel,
        params: &kernel::DensityPaintParams,
        heightmap: TextureId,
        target: TextureId,
    ) -> Result<()> {
        let heights = le_f32s(&self.texture(heightmap)?.data);
        let value = params.value.min(255) as u8;

        let tex = self
            .textures
            .get_mut(target.0)
            .ok_or(Error::InvalidHandle { kind: "texture" })?;
        let width = tex.width;
        let res = params.detail_resolution.min(width);
        tex.data.par_iter_mut().enumerate().for_each(|(i, texel)| {
            let x = i as u32 % width;
            let y = i as u32 / width;
            if x >= res || y >= res {
                return;
            }
            let p = kernel::texel_world_position(params, &heights, x, y);
            if kernel::paint_contains(kernel, params, p) {
                *texel = value;
            }
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_tree(
        &mut self,
        kernel: kernel::TreeKernel,
        params: &kernel::TreeInstanceParams,
        records: BufferId,
        heightmap: TextureId,
        holes: Option<TextureId>,
        counters: BufferId,
        output: BufferId,
    ) -> Result<()> {
        let records: Vec<TreeInstanceRecord> = bytemuck::pod_collect_to_vec(&self.buffer(records)?.data);
        let heights = le_f32s(&self.texture(heightmap)?.data);
        let holes = self.float_texels(holes)?;

        let slot_offset = params.counter_slot as usize * 4;
        let counter_bytes = self.buffer(counters)?.data.get(slot_offset..slot_offset + 4).ok_or_else(|| {
            Error::Gpu(format!("counter slot {} outside counter buffer", params.counter_slot))
        })?;
        let counter = AtomicU32::new(u32::from_le_bytes([
            counter_bytes[0],
            counter_bytes[1],
            counter_bytes[2],
            counter_bytes[3],
        ]));

        let count = (params.record_count as usize).min(records.len());
        let written: Vec<(u32, Mat4)> = records[..count]
            .par_iter()
            .filter_map(|record| {
                let matrix = kernel::tree_instance_matrix(kernel, params, record, &heights, &holes)?;
                let slot = counter.fetch_add(1, Ordering::Relaxed);
                (slot < params.capacity).then_some((params.start_index + slot, matrix))
            })
            .collect();

        let out = self.buffer_mut(output)?;
        for (index, matrix) in written {
            let begin = index as usize * MATRIX_SIZE as usize;
            if let Some(dst) = out.data.get_mut(begin..begin + MATRIX_SIZE as usize) {
                dst.copy_from_slice(bytemuck::bytes_of(&matrix));
            }
        }

        let final_count = counter.into_inner();
        let counters = self.buffer_mut(counters)?;
        counters.data[slot_offset..slot_offset + 4].copy_from_slice(&final_count.to_le_bytes());
        Ok(())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn register_render_source(&mut self, prototype: &Prototype) -> Result<RenderKey> {
        let handle = self.sources.insert(HostRenderSource {
            name: prototype.name().to_string(),
            instance_count: 0,
            transform_buffer: None,
            start_index: 0,
        });
        Ok(RenderKey::from_handle(handle))
    }

    fn dispose_render_source(&mut self, key: RenderKey) {
        if let Some(h) = key.handle() {
            self.sources.remove(h);
        }
    }

    fn set_buffer_size(&mut self, key: RenderKey, count: u32) -> Result<()> {
        self.source_mut(key)?.instance_count = count;
        Ok(())
    }

    fn bind_transform_buffer(&mut self, key: RenderKey, buffer: BufferId, start_index: u32) -> Result<()> {
        self.buffer(buffer)?;
        let source = self.source_mut(key)?;
        source.transform_buffer = Some(buffer);
        source.start_index = start_index;
        Ok(())
    }

    fn transform_buffer(&self, key: RenderKey) -> Option<BufferId> {
        self.render_source(key).and_then(|s| s.transform_buffer)
    }

    fn instance_count(&self, key: RenderKey) -> Option<u32> {
        self.render_source(key).map(|s| s.instance_count)
    }

    fn create_buffer(&mut self, label: &str, usage: BufferUsage, size: u64) -> BufferId {
        self.stats.buffers_created += 1;
        BufferId(self.buffers.insert(HostBuffer {
            label: label.to_string(),
            usage,
            data: vec![0; size as usize],
        }))
    }

    fn buffer_size(&self, id: BufferId) -> Option<u64> {
        self.buffers.get(id.0).map(|b| b.data.len() as u64)
    }

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let buf = self.buffer_mut(id)?;
        let begin = offset as usize;
        let dst = buf.data.get_mut(begin..begin + data.len()).ok_or_else(|| {
            Error::Gpu(format!("write of {} bytes at {offset} overflows buffer", data.len()))
        })?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn copy_buffer(&mut self, src: BufferId, dst: BufferId, size: u64) -> Result<()> {
        let n = size as usize;
        let bytes = self
            .buffer(src)?
            .data
            .get(..n)
            .ok_or_else(|| Error::Gpu(format!("copy of {n} bytes overflows source")))?
            .to_vec();
        let target = self.buffer_mut(dst)?;
        target
            .data
            .get_mut(..n)
            .ok_or_else(|| Error::Gpu(format!("copy of {n} bytes overflows destination")))?
            .copy_from_slice(&bytes);
        Ok(())
    }

    fn clear_buffer(&mut self, id: BufferId) -> Result<()> {
        self.buffer_mut(id)?.data.fill(0);
        Ok(())
    }

    fn release_buffer(&mut self, id: BufferId) {
        self.buffers.remove(id.0);
    }

    fn create_texture(&mut self, label: &str, format: TextureFormat, width: u32, height: u32) -> TextureId {
        self.stats.textures_created += 1;
        let len = width as usize * height as usize * format.bytes_per_texel();
        TextureId(self.textures.insert(HostTexture {
            label: label.to_string(),
            format,
            width,
            height,
            data: vec![0; len],
        }))
    }

    fn texture_size(&self, id: TextureId) -> Option<(u32, u32)> {
        self.textures.get(id.0).map(|t| (t.width, t.height))
    }

    fn write_texture(&mut self, id: TextureId, data: &[u8]) -> Result<()> {
        let tex = self
            .textures
            .get_mut(id.0)
            .ok_or(Error::InvalidHandle { kind: "texture" })?;
        if data.len() != tex.data.len() {
            return Err(Error::TextureSize {
                expected: tex.data.len(),
                actual: data.len(),
            });
        }
        tex.data.copy_from_slice(data);
        Ok(())
    }

    fn read_texture(&mut self, id: TextureId) -> Result<Vec<u8>> {
        let tex = self.texture(id)?;
        debug_assert_eq!(
            tex.data.len(),
            tex.width as usize * tex.height as usize * tex.format.bytes_per_texel()
        );
        Ok(tex.data.clone())
    }

    fn release_texture(&mut self, id: TextureId) {
        self.textures.remove(id.0);
    }

    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()> {
        self.stats.dispatches += 1;
        log::trace!("host dispatch {} groups {:?}", dispatch.entry_point(), dispatch.thread_groups());
        match dispatch {
            Dispatch::CaptureDetail {
                kernel,
                params,
                source,
                holes,
                target,
            } => self.run_capture(*kernel, params, *source, *holes, *target),
            Dispatch::PaintDensity {
                kernel,
                params,
                heightmap,
                target,
            } => self.run_paint(*kernel, params, *heightmap, *target),
            Dispatch::TreeInstances {
                kernel,
                params,
                records,
                heightmap,
                holes,
                counters,
                output,
            } => self.run_tree(*kernel, params, *records, *heightmap, *holes, *counters, *output),
        }
    }

    fn request_read(&mut self, id: BufferId, offset: u64, size: u64) -> Result<ReadbackId> {
        let buf = self.buffer(id)?;
        let begin = offset as usize;
        let data = buf
            .data
            .get(begin..begin + size as usize)
            .ok_or_else(|| Error::Readback(format!("read of {size} bytes at {offset} outside '{}'", buf.label)))?
            .to_vec();
        self.stats.reads_requested += 1;
        Ok(ReadbackId(self.reads.insert(HostRead { data, polls_left: 1 })))
    }

    fn poll_read(&mut self, ticket: ReadbackId) -> Option<Result<Vec<u8>>> {
        let Some(read) = self.reads.get_mut(ticket.0) else {
            return Some(Err(Error::InvalidHandle { kind: "readback" }));
        };
        if read.polls_left > 0 {
            read.polls_left -= 1;
            return None;
        }
        self.reads.remove(ticket.0).map(|r| Ok(r.data))
    }

    fn wait_read(&mut self, ticket: ReadbackId) -> Result<Vec<u8>> {
        self.reads
            .remove(ticket.0)
            .map(|r| r.data)
            .ok_or(Error::InvalidHandle { kind: "readback" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::kernel::{
        CaptureKernel, DensityPaintParams, DetailCaptureParams, PaintKernel, TreeInstanceParams, TreeKernel,
    };

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_textures_start_zeroed() {
        let mut backend = HostBackend::new();
        let tex = backend.create_texture("density", TextureFormat::Density8, 4, 4);
        assert_eq!(backend.read_texture(tex).unwrap(), vec![0u8; 16]);
        assert_eq!(backend.texture_size(tex), Some((4, 4)));
    }

    #[test]
    fn test_write_texture_size_mismatch() {
        let mut backend = HostBackend::new();
        let tex = backend.create_texture("height", TextureFormat::Height32F, 2, 2);
        let err = backend.write_texture(tex, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::TextureSize { expected: 16, actual: 4 }));
    }

    #[test]
    fn test_released_handles_do_not_resolve() {
        let mut backend = HostBackend::new();
        let buf = backend.create_buffer("tmp", BufferUsage::Records, 16);
        backend.release_buffer(buf);
        assert!(backend.buffer_size(buf).is_none());
        let again = backend.create_buffer("tmp", BufferUsage::Records, 16);
        assert_ne!(buf, again);
        assert!(backend.write_buffer(buf, 0, &[1]).is_err());
    }

    #[test]
    fn test_copy_buffer_prefix() {
        let mut backend = HostBackend::new();
        let a = backend.create_buffer("a", BufferUsage::Transforms, 8);
        let b = backend.create_buffer("b", BufferUsage::Transforms, 16);
        backend.write_buffer(a, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        backend.copy_buffer(a, b, 8).unwrap();
        let ticket = backend.request_read(b, 0, 16).unwrap();
        let bytes = backend.wait_read(ticket).unwrap();
        assert_eq!(&bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..], &[0; 8]);
    }

    #[test]
    fn test_capture_dispatch() {
        let mut backend = HostBackend::new();
        let raw: Vec<u32> = vec![16, 8, 0, 40];
        let src = backend.create_buffer("raw", BufferUsage::Records, 16);
        backend.write_buffer(src, 0, bytemuck::cast_slice(&raw)).unwrap();
        let target = backend.create_texture("density", TextureFormat::Density8, 2, 2);

        backend
            .dispatch(&Dispatch::CaptureDetail {
                kernel: CaptureKernel::Plain,
                params: DetailCaptureParams {
                    resolution: 2,
                    ..Default::default()
                },
                source: src,
                holes: None,
                target,
            })
            .unwrap();
        assert_eq!(backend.read_texture(target).unwrap(), vec![255, 128, 0, 255]);
        assert_eq!(backend.stats().dispatches, 1);
    }

    #[test]
    fn test_paint_dispatch_sphere() {
        let mut backend = HostBackend::new();
        let heightmap = backend.create_texture("height", TextureFormat::Height32F, 2, 2);
        let target = backend.create_texture("density", TextureFormat::Density8, 4, 4);

        let mut params = DensityPaintParams {
            detail_resolution: 4,
            terrain_size: [4.0, 1.0, 4.0],
            heightmap_resolution: 2,
            value: 200,
            ..Default::default()
        };
        params.shape_a = [0.5, 0.0, 0.5, 0.1];
        backend
            .dispatch(&Dispatch::PaintDensity {
                kernel: PaintKernel::Sphere,
                params,
                heightmap,
                target,
            })
            .unwrap();

        let texels = backend.read_texture(target).unwrap();
        assert_eq!(texels[0], 200);
        assert_eq!(texels.iter().filter(|&&t| t != 0).count(), 1);
    }

    #[test]
    fn test_tree_dispatch_fills_segment_and_counter() {
        let mut backend = HostBackend::new();
        let records: Vec<TreeInstanceRecord> = (0..10)
            .map(|i| TreeInstanceRecord {
                position: [i as f32 / 10.0, 0.0, 0.5],
                rotation: 0.0,
                width_scale: 1.0,
                height_scale: 1.0,
                prototype_index: (i % 2) as u32,
            })
            .collect();
        let rec_buf = backend.create_buffer("records", BufferUsage::Records, 28 * 10);
        backend.write_buffer(rec_buf, 0, bytemuck::cast_slice(&records)).unwrap();
        let heightmap = backend.create_texture("height", TextureFormat::Height32F, 2, 2);
        backend.write_texture(heightmap, &f32_bytes(&[0.5; 4])).unwrap();
        let counters = backend.create_buffer("counters", BufferUsage::Counters, 8);
        let output = backend.create_buffer("matrices", BufferUsage::Transforms, MATRIX_SIZE * 8);

        let params = TreeInstanceParams {
            record_count: 10,
            terrain_size: [10.0, 2.0, 10.0],
            heightmap_resolution: 2,
            terrain_prototype_index: 1,
            start_index: 2,
            capacity: 6,
            counter_slot: 1,
            ..Default::default()
        };
        backend
            .dispatch(&Dispatch::TreeInstances {
                kernel: TreeKernel::Plain,
                params,
                records: rec_buf,
                heightmap,
                holes: None,
                counters,
                output,
            })
            .unwrap();

        let ticket = backend.request_read(counters, 4, 4).unwrap();
        assert_eq!(backend.wait_read(ticket).unwrap(), 5u32.to_le_bytes().to_vec());

        let matrices = backend.read_matrices(output, 2, 5).unwrap();
        let mut xs: Vec<i32> = matrices.iter().map(|m| m.w_axis.x.round() as i32).collect();
        xs.sort();
        assert_eq!(xs, vec![1, 3, 5, 7, 9]);
        assert!(matrices.iter().all(|m| (m.w_axis.y - 1.0).abs() < 1e-5));
        assert_eq!(backend.read_matrices(output, 0, 2).unwrap(), vec![Mat4::ZERO; 2]);
    }

    #[test]
    fn test_tree_dispatch_respects_capacity() {
        let mut backend = HostBackend::new();
        let records = vec![TreeInstanceRecord::default(); 4];
        let rec_buf = backend.create_buffer("records", BufferUsage::Records, 28 * 4);
        backend.write_buffer(rec_buf, 0, bytemuck::cast_slice(&records)).unwrap();
        let heightmap = backend.create_texture("height", TextureFormat::Height32F, 1, 1);
        let counters = backend.create_buffer("counters", BufferUsage::Counters, 4);
        let output = backend.create_buffer("matrices", BufferUsage::Transforms, MATRIX_SIZE * 2);

        backend
            .dispatch(&Dispatch::TreeInstances {
                kernel: TreeKernel::Plain,
                params: TreeInstanceParams {
                    record_count: 4,
                    heightmap_resolution: 1,
                    capacity: 2,
                    ..Default::default()
                },
                records: rec_buf,
                heightmap,
                holes: None,
                counters,
                output,
            })
            .unwrap();
        // Counter keeps counting past capacity; writes beyond it are dropped.
        let ticket = backend.request_read(counters, 0, 4).unwrap();
        assert_eq!(backend.wait_read(ticket).unwrap(), 4u32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_render_source_bookkeeping() {
        use crate::assets::MeshAsset;
        use crate::prototype::{Prototype, PrototypeDescriptor};
        use std::sync::Arc;

        let mesh = Arc::new(MeshAsset::new("rock"));
        let proto = Prototype::new(PrototypeDescriptor::from_mesh(&mesh, &[]), Default::default());

        let mut backend = HostBackend::new();
        let key = backend.register_render_source(&proto).unwrap();
        assert!(key.is_some());
        let buf = backend.create_buffer("m", BufferUsage::Transforms, MATRIX_SIZE);
        backend.bind_transform_buffer(key, buf, 0).unwrap();
        backend.set_buffer_size(key, 1).unwrap();
        assert_eq!(backend.transform_buffer(key), Some(buf));
        assert_eq!(backend.instance_count(key), Some(1));
        assert_eq!(backend.render_source(key).unwrap().name, "rock");

        backend.dispose_render_source(key);
        assert_eq!(backend.instance_count(key), None);
        backend.dispose_render_source(RenderKey::NONE);
    }
}
