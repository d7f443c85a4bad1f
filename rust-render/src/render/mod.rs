//! Rendering engine: produces one RGBA8 frame per timeline position.

mod compositor;

pub use compositor::CpuCompositor;

use bytes::Bytes;

use crate::Result;

/// Geometry shared by the engine and the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A source of sequential frames.
///
/// `render_frame` is CPU-bound and synchronous; callers run it on the
/// blocking pool.
pub trait FrameRenderer: Send + Sync {
    fn geometry(&self) -> FrameGeometry;

    fn frame_count(&self) -> u64;

    /// Render frame `index` (0-based) as tightly packed, opaque RGBA8.
    fn render_frame(&self, index: u64) -> Result<Bytes>;
}
