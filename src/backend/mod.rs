//! Rendering backend interface.
//!
//! The pipeline never talks to a graphics API directly. Everything it needs
//! from the device (render-source registration, structured buffers,
//! single-channel textures, compute dispatch, async readback) goes through
//! `RenderBackend`. `HostBackend` runs the kernels on the CPU and is the
//! reference for their semantics; `WgpuBackend` runs them as WGSL compute
//! shaders.

pub mod handle;
pub mod kernel;
pub mod readback;
pub mod host;
pub mod gpu;

pub use handle::{BufferId, Handle, HandleTable, ReadbackId, RenderKey, TextureId};
pub use kernel::{
    CaptureKernel, DensityPaintParams, DetailCaptureParams, Dispatch, PaintKernel, TreeInstanceParams,
    TreeKernel,
};
pub use readback::ReadbackQueue;
pub use host::HostBackend;
pub use gpu::WgpuBackend;

use crate::core::Result;
use crate::prototype::Prototype;

/// Size in bytes of one transform matrix
pub const MATRIX_SIZE: u64 = std::mem::size_of::<glam::Mat4>() as u64;

/// What a buffer is used for; decides usage flags on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Per-instance world matrices read by the draw path
    Transforms,
    /// Read-only structured input (tree records, raw detail cells)
    Records,
    /// Atomic u32 counters
    Counters,
    /// Small parameter blocks
    Params,
}

/// Single-channel texture formats used by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8-bit density, one byte per texel
    Density8,
    /// 32-bit float (heightmaps, holes masks), four bytes per texel
    Height32F,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TextureFormat::Density8 => 1,
            TextureFormat::Height32F => 4,
        }
    }
}

/// Device operations consumed by the pipeline.
///
/// Textures are zero-initialized on creation. Releasing a resource after a
/// dispatch that references it has been submitted is allowed; the backend
/// keeps it alive until that work retires.
pub trait RenderBackend {
    fn name(&self) -> &'static str;

    // -- Render sources ----------------------------------------------------

    /// Register a prototype with the draw system. Returns a non-zero key.
    fn register_render_source(&mut self, prototype: &Prototype) -> Result<RenderKey>;

    /// Remove a render source. Unknown or zero keys are ignored.
    fn dispose_render_source(&mut self, key: RenderKey);

    /// Number of instances the draw system renders for `key`.
    fn set_buffer_size(&mut self, key: RenderKey, count: u32) -> Result<()>;

    /// Attach the transform buffer the draw system reads for `key`.
    fn bind_transform_buffer(&mut self, key: RenderKey, buffer: BufferId, start_index: u32) -> Result<()>;

    fn transform_buffer(&self, key: RenderKey) -> Option<BufferId>;

    fn instance_count(&self, key: RenderKey) -> Option<u32>;

    // -- Buffers -------------------------------------------------------------

    fn create_buffer(&mut self, label: &str, usage: BufferUsage, size: u64) -> BufferId;

    fn buffer_size(&self, id: BufferId) -> Option<u64>;

    fn write_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()>;

    fn copy_buffer(&mut self, src: BufferId, dst: BufferId, size: u64) -> Result<()>;

    fn clear_buffer(&mut self, id: BufferId) -> Result<()>;

    fn release_buffer(&mut self, id: BufferId);

    // -- Textures ------------------------------------------------------------

    fn create_texture(&mut self, label: &str, format: TextureFormat, width: u32, height: u32) -> TextureId;

    fn texture_size(&self, id: TextureId) -> Option<(u32, u32)>;

    /// Replace the full contents; `data` is tightly packed rows.
    fn write_texture(&mut self, id: TextureId, data: &[u8]) -> Result<()>;

    /// Blocking read of the full contents as tightly packed rows.
    fn read_texture(&mut self, id: TextureId) -> Result<Vec<u8>>;

    fn release_texture(&mut self, id: TextureId);

    // -- Compute ---------------------------------------------------------------

    fn dispatch(&mut self, dispatch: &Dispatch) -> Result<()>;

    // -- Readback --------------------------------------------------------------

    /// Start an asynchronous read of `size` bytes at `offset`.
    fn request_read(&mut self, id: BufferId, offset: u64, size: u64) -> Result<ReadbackId>;

    /// Non-blocking completion check. Completed tickets are consumed.
    fn poll_read(&mut self, ticket: ReadbackId) -> Option<Result<Vec<u8>>>;

    /// Block until the read completes.
    fn wait_read(&mut self, ticket: ReadbackId) -> Result<Vec<u8>>;
}
