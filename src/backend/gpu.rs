//! wgpu backend.
//!
//! Runs the kernels as WGSL compute shaders. Density textures live on the
//! device as `R32Uint` (storage textures cannot be 8-bit unsigned integer on
//! every adapter) and are narrowed to one byte per texel on upload/readback,
//! so callers see the same tightly packed 8-bit layout the host backend uses.

use std::collections::HashMap;
use std::sync::mpsc;

use wgpu::util::DeviceExt;

use super::handle::{BufferId, HandleTable, ReadbackId, RenderKey, TextureId};
use super::kernel::{CaptureKernel, Dispatch, PaintKernel, TreeKernel};
use super::{BufferUsage, RenderBackend, TextureFormat};
use crate::core::{Error, Result};
use crate::prototype::Prototype;

const COMMON_WGSL: &str = include_str!("../../shaders/common.wgsl");

struct GpuBuffer {
    label: String,
    buffer: wgpu::Buffer,
    /// Size the caller asked for; the device buffer is rounded up to 4 bytes
    size: u64,
}

struct GpuTexture {
    format: TextureFormat,
    width: u32,
    height: u32,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct GpuRenderSource {
    instance_count: u32,
    transform_buffer: Option<BufferId>,
    start_index: u32,
}

struct GpuRead {
    staging: wgpu::Buffer,
    size: u64,
    rx: mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
}

/// Compute pipelines, one per kernel entry point.
struct Kernels {
    capture_layout: wgpu::BindGroupLayout,
    paint_layout: wgpu::BindGroupLayout,
    tree_layout: wgpu::BindGroupLayout,
    pipelines: HashMap<&'static str, wgpu::ComputePipeline>,
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn float_texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn density_storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::R32Uint,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

impl Kernels {
    fn new(device: &wgpu::Device) -> Self {
        let capture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("detail_capture_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                float_texture_entry(2),
                density_storage_entry(3),
            ],
        });
        let paint_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("density_paint_layout"),
            entries: &[uniform_entry(0), float_texture_entry(1), density_storage_entry(2)],
        });
        let tree_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("tree_instances_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                float_texture_entry(2),
                float_texture_entry(3),
                storage_entry(4, false),
                storage_entry(5, false),
            ],
        });

        let mut pipelines = HashMap::new();
        let capture_entries: Vec<_> = CaptureKernel::ALL.iter().map(|k| k.entry_point()).collect();
        let paint_entries: Vec<_> = PaintKernel::ALL.iter().map(|k| k.entry_point()).collect();
        let tree_entries: Vec<_> = TreeKernel::ALL.iter().map(|k| k.entry_point()).collect();
        for (name, source, layout, entries) in [
            (
                "detail_capture",
                include_str!("../../shaders/detail_capture.wgsl"),
                &capture_layout,
                capture_entries,
            ),
            (
                "density_paint",
                include_str!("../../shaders/density_paint.wgsl"),
                &paint_layout,
                paint_entries,
            ),
            (
                "tree_instances",
                include_str!("../../shaders/tree_instances.wgsl"),
                &tree_layout,
                tree_entries,
            ),
        ] {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(format!("{COMMON_WGSL}\n{source}").into()),
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(name),
                bind_group_layouts: &[layout],
                immediate_size: 0,
            });
            for entry_point in entries {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(entry_point),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: Some(entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                });
                pipelines.insert(entry_point, pipeline);
            }
        }

        Self {
            capture_layout,
            paint_layout,
            tree_layout,
            pipelines,
        }
    }
}

/// Device backend.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    kernels: Kernels,
    /// 1x1 solid texel bound when a kernel samples no holes mask
    solid_view: wgpu::TextureView,
    sources: HandleTable<GpuRenderSource>,
    buffers: HandleTable<GpuBuffer>,
    textures: HandleTable<GpuTexture>,
    reads: HandleTable<GpuRead>,
}

fn align4(size: u64) -> u64 {
    size.max(4).div_ceil(4) * 4
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    let copy = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    match usage {
        BufferUsage::Transforms => copy | wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::VERTEX,
        BufferUsage::Records | BufferUsage::Counters => copy | wgpu::BufferUsages::STORAGE,
        BufferUsage::Params => copy | wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::STORAGE,
    }
}

impl WgpuBackend {
    /// Create a backend on the best available adapter, without a surface.
    pub async fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;

        let adapter_limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("thicket_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits {
                    max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                    max_buffer_size: adapter_limits.max_buffer_size,
                    ..Default::default()
                },
                memory_hints: wgpu::MemoryHints::Performance,
                experimental_features: Default::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|e| Error::Gpu(e.to_string()))?;

        log::info!("GPU backend on {}", adapter.get_info().name);
        Ok(Self::from_device(device, queue))
    }

    /// Blocking `new_headless` for tools and tests.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new_headless())
    }

    /// Wrap an existing device, e.g. the one the renderer already owns.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let kernels = Kernels::new(&device);

        let solid = device.create_texture_with_data(
            &queue,
            &wgpu::TextureDescriptor {
                label: Some("solid_holes"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &1.0f32.to_le_bytes(),
        );
        let solid_view = solid.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            device,
            queue,
            kernels,
            solid_view,
            sources: HandleTable::new(),
            buffers: HandleTable::new(),
            textures: HandleTable::new(),
            reads: HandleTable::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Device buffer behind `id`, for binding in the draw path.
    pub fn raw_buffer(&self, id: BufferId) -> Option<&wgpu::Buffer> {
        self.buffers.get(id.0).map(|b| &b.buffer)
    }

    pub fn texture_view(&self, id: TextureId) -> Option<&wgpu::TextureView> {
        self.textures.get(id.0).map(|t| &t.view)
    }

    fn buffer(&self, id: BufferId) -> Result<&GpuBuffer> {
        self.buffers.get(id.0).ok_or(Error::InvalidHandle { kind: "buffer" })
    }

    fn texture(&self, id: TextureId) -> Result<&GpuTexture> {
        self.textures.get(id.0).ok_or(Error::InvalidHandle { kind: "texture" })
    }

    fn source_mut(&mut self, key: RenderKey) -> Result<&mut GpuRenderSource> {
        key.handle()
            .and_then(|h| self.sources.get_mut(h))
            .ok_or(Error::InvalidHandle { kind: "render key" })
    }

    fn holes_view(&self, id: Option<TextureId>) -> Result<&wgpu::TextureView> {
        match id {
            Some(id) => Ok(&self.texture(id)?.view),
            None => Ok(&self.solid_view),
        }
    }

    fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| Error::Gpu(format!("device poll failed: {e}")))
    }

    fn build_bind_group(&self, dispatch: &Dispatch, params: &wgpu::Buffer) -> Result<wgpu::BindGroup> {
        let bind_group = match dispatch {
            Dispatch::CaptureDetail {
                source, holes, target, ..
            } => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("detail_capture_bg"),
                layout: &self.kernels.capture_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.buffer(*source)?.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(self.holes_view(*holes)?),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(&self.texture(*target)?.view),
                    },
                ],
            }),
            Dispatch::PaintDensity {
                heightmap, target, ..
            } => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("density_paint_bg"),
                layout: &self.kernels.paint_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&self.texture(*heightmap)?.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&self.texture(*target)?.view),
                    },
                ],
            }),
            Dispatch::TreeInstances {
                records,
                heightmap,
                holes,
                counters,
                output,
                ..
            } => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("tree_instances_bg"),
                layout: &self.kernels.tree_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.buffer(*records)?.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&self.texture(*heightmap)?.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(self.holes_view(*holes)?),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: self.buffer(*counters)?.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: self.buffer(*output)?.buffer.as_entire_binding(),
                    },
                ],
            }),
        };
        Ok(bind_group)
    }
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn register_render_source(&mut self, prototype: &Prototype) -> Result<RenderKey> {
        let handle = self.sources.insert(GpuRenderSource {
            instance_count: 0,
            transform_buffer: None,
            start_index: 0,
        });
        log::debug!("Registered render source '{}'", prototype.name());
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
        key.handle()
            .and_then(|h| self.sources.get(h))
            .and_then(|s| s.transform_buffer)
    }

    fn instance_count(&self, key: RenderKey) -> Option<u32> {
        key.handle().and_then(|h| self.sources.get(h)).map(|s| s.instance_count)
    }

    fn create_buffer(&mut self, label: &str, usage: BufferUsage, size: u64) -> BufferId {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: align4(size),
            usage: buffer_usages(usage),
            mapped_at_creation: false,
        });
        BufferId(self.buffers.insert(GpuBuffer {
            label: label.to_string(),
            buffer,
            size,
        }))
    }

    fn buffer_size(&self, id: BufferId) -> Option<u64> {
        self.buffers.get(id.0).map(|b| b.size)
    }

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let buf = self.buffer(id)?;
        if offset + data.len() as u64 > buf.size {
            return Err(Error::Gpu(format!(
                "write of {} bytes at {offset} overflows buffer '{}'",
                data.len(),
                buf.label
            )));
        }
        if offset % 4 != 0 {
            return Err(Error::Gpu(format!("unaligned write offset {offset} on '{}'", buf.label)));
        }
        if data.len() % 4 == 0 {
            self.queue.write_buffer(&buf.buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len().div_ceil(4) * 4, 0);
            self.queue.write_buffer(&buf.buffer, offset, &padded);
        }
        Ok(())
    }

    fn copy_buffer(&mut self, src: BufferId, dst: BufferId, size: u64) -> Result<()> {
        let from = self.buffer(src)?;
        let to = self.buffer(dst)?;
        if size > from.size || size > to.size {
            return Err(Error::Gpu(format!("copy of {size} bytes overflows '{}' or '{}'", from.label, to.label)));
        }
        if size == 0 {
            return Ok(());
        }
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("copy_buffer"),
        });
        encoder.copy_buffer_to_buffer(&from.buffer, 0, &to.buffer, 0, align4(size));
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn clear_buffer(&mut self, id: BufferId) -> Result<()> {
        let buf = self.buffer(id)?;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("clear_buffer"),
        });
        encoder.clear_buffer(&buf.buffer, 0, None);
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn release_buffer(&mut self, id: BufferId) {
        // wgpu keeps the allocation alive until submitted work retires
        self.buffers.remove(id.0);
    }

    fn create_texture(&mut self, label: &str, format: TextureFormat, width: u32, height: u32) -> TextureId {
        let (device_format, usage) = match format {
            TextureFormat::Density8 => (
                wgpu::TextureFormat::R32Uint,
                wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
            ),
            TextureFormat::Height32F => (
                wgpu::TextureFormat::R32Float,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST,
            ),
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: device_format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        TextureId(self.textures.insert(GpuTexture {
            format,
            width,
            height,
            texture,
            view,
        }))
    }

    fn texture_size(&self, id: TextureId) -> Option<(u32, u32)> {
        self.textures.get(id.0).map(|t| (t.width, t.height))
    }

    fn write_texture(&mut self, id: TextureId, data: &[u8]) -> Result<()> {
        let tex = self.texture(id)?;
        let expected = tex.width as usize * tex.height as usize * tex.format.bytes_per_texel();
        if data.len() != expected {
            return Err(Error::TextureSize {
                expected,
                actual: data.len(),
            });
        }
        if expected == 0 {
            return Ok(());
        }
        let widened;
        let bytes = match tex.format {
            TextureFormat::Density8 => {
                widened = data.iter().flat_map(|&v| u32::from(v).to_le_bytes()).collect::<Vec<u8>>();
                &widened[..]
            }
            TextureFormat::Height32F => data,
        };
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(tex.width * 4),
                rows_per_image: Some(tex.height),
            },
            wgpu::Extent3d {
                width: tex.width,
                height: tex.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn read_texture(&mut self, id: TextureId) -> Result<Vec<u8>> {
        let tex = self.texture(id)?;
        if tex.width == 0 || tex.height == 0 {
            return Ok(Vec::new());
        }
        let row_bytes = tex.width * 4;
        let padded_row = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture_readback"),
            size: padded_row as u64 * tex.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("read_texture"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(tex.height),
                },
            },
            wgpu::Extent3d {
                width: tex.width,
                height: tex.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait()?;
        rx.recv()
            .map_err(|e| Error::Readback(e.to_string()))?
            .map_err(|e| Error::Readback(e.to_string()))?;

        let mut out = Vec::with_capacity(tex.width as usize * tex.height as usize * tex.format.bytes_per_texel());
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks_exact(padded_row as usize) {
                let row = &row[..row_bytes as usize];
                match tex.format {
                    TextureFormat::Density8 => out.extend(
                        row.chunks_exact(4)
                            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]).min(255) as u8),
                    ),
                    TextureFormat::Height32F => out.extend_from_slice(row),
                }
            }
        }
        staging.unmap();
        Ok(out)
    }

    fn release_texture(&mut self, id: TextureId) {
        self.textures.remove(id.0);
    }

    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()> {
        let entry_point = dispatch.entry_point();
        let pipeline = self
            .kernels
            .pipelines
            .get(entry_point)
            .ok_or_else(|| Error::Gpu(format!("no pipeline for kernel '{entry_point}'")))?;

        let contents: &[u8] = match dispatch {
            Dispatch::CaptureDetail { params, .. } => bytemuck::bytes_of(params),
            Dispatch::PaintDensity { params, .. } => bytemuck::bytes_of(params),
            Dispatch::TreeInstances { params, .. } => bytemuck::bytes_of(params),
        };
        let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(entry_point),
            contents,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = self.build_bind_group(dispatch, &params)?;

        let [x, y, z] = dispatch.thread_groups();
        if x == 0 || y == 0 || z == 0 {
            return Ok(());
        }
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(entry_point),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry_point),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue.submit(Some(encoder.finish()));
        log::trace!("gpu dispatch {entry_point} groups [{x}, {y}, {z}]");
        Ok(())
    }

    fn request_read(&mut self, id: BufferId, offset: u64, size: u64) -> Result<ReadbackId> {
        let buf = self.buffer(id)?;
        if offset + size > buf.size || offset % 4 != 0 {
            return Err(Error::Readback(format!(
                "read of {size} bytes at {offset} outside '{}'",
                buf.label
            )));
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("buffer_readback"),
            size: align4(size),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if size > 0 {
            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("request_read"),
            });
            encoder.copy_buffer_to_buffer(&buf.buffer, offset, &staging, 0, align4(size));
            self.queue.submit(Some(encoder.finish()));
        }

        let (tx, rx) = mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        Ok(ReadbackId(self.reads.insert(GpuRead { staging, size, rx })))
    }

    fn poll_read(&mut self, ticket: ReadbackId) -> Option<Result<Vec<u8>>> {
        let _ = self.device.poll(wgpu::PollType::Poll);
        let read = match self.reads.get(ticket.0) {
            Some(read) => read,
            None => return Some(Err(Error::InvalidHandle { kind: "readback" })),
        };
        match read.rx.try_recv() {
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.reads.remove(ticket.0);
                Some(Err(Error::Readback("map callback dropped".to_string())))
            }
            Ok(result) => {
                let read = self.reads.remove(ticket.0)?;
                Some(result.map_err(|e| Error::Readback(e.to_string())).map(|()| finish_read(read)))
            }
        }
    }

    fn wait_read(&mut self, ticket: ReadbackId) -> Result<Vec<u8>> {
        let read = self
            .reads
            .remove(ticket.0)
            .ok_or(Error::InvalidHandle { kind: "readback" })?;
        self.wait()?;
        read.rx
            .recv()
            .map_err(|e| Error::Readback(e.to_string()))?
            .map_err(|e| Error::Readback(e.to_string()))?;
        Ok(finish_read(read))
    }
}

/// Copy a mapped staging buffer out and unmap it.
fn finish_read(read: GpuRead) -> Vec<u8> {
    let data = {
        let mapped = read.staging.slice(..).get_mapped_range();
        mapped[..read.size as usize].to_vec()
    };
    read.staging.unmap();
    data
}
