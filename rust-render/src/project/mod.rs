//! Project specifications: the payload of a render job.

mod model;
mod resolve;

pub use model::{Clip, ClipSource, Layer, MAX_DIMENSION, MAX_FPS, ProjectSpec, Rect, Rgba};
pub use resolve::{AssetResolver, ResolvedProject};
