use bytes::Bytes;
use image::RgbaImage;

use super::{FrameGeometry, FrameRenderer};
use crate::project::{ClipSource, Rect, ResolvedProject, Rgba};
use crate::{Error, Result};

/// CPU compositor for resolved projects.
///
/// Clips are drawn bottom-to-top with straight-alpha "over" blending onto an
/// opaque background, so every output pixel has alpha 255.
pub struct CpuCompositor {
    project: ResolvedProject,
}

impl CpuCompositor {
    pub fn new(project: ResolvedProject) -> Self {
        Self { project }
    }

    fn canvas_rect(&self) -> Rect {
        Rect {
            x: 0,
            y: 0,
            width: self.project.spec.width,
            height: self.project.spec.height,
        }
    }
}

impl FrameRenderer for CpuCompositor {
    fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            width: self.project.spec.width,
            height: self.project.spec.height,
            fps: self.project.spec.fps,
        }
    }

    fn frame_count(&self) -> u64 {
        self.project.frame_count()
    }

    fn render_frame(&self, index: u64) -> Result<Bytes> {
        let total = self.frame_count();
        if index >= total {
            return Err(Error::Render(format!(
                "frame {} out of range (project has {} frames)",
                index, total
            )));
        }

        let spec = &self.project.spec;
        let mut canvas = Canvas::filled(spec.width, spec.height, spec.background);

        for clip in spec.layers.iter().flat_map(|l| l.clips.iter()) {
            if !clip.is_visible_at(index) {
                continue;
            }
            let rect = clip.rect.unwrap_or_else(|| self.canvas_rect());
            let opacity = (clip.opacity * 255.0).round().clamp(0.0, 255.0) as u16;

            match &clip.source {
                ClipSource::Solid { color } => canvas.fill_rect(rect, *color, opacity),
                ClipSource::Image { asset } => {
                    let image = self.project.images.get(asset).ok_or_else(|| {
                        Error::Render(format!("asset '{}' was not resolved", asset))
                    })?;
                    canvas.draw_image(rect, image, opacity);
                }
            }
        }

        Ok(Bytes::from(canvas.data))
    }
}

struct Canvas {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Canvas {
    fn filled(width: u32, height: u32, bg: Rgba) -> Self {
        let [r, g, b, _] = bg.0;
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&[r, g, b, 255]);
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Intersection of `rect` with the canvas as `(x0, y0, x1, y1)`.
    fn clip_to_canvas(&self, rect: Rect) -> Option<(u32, u32, u32, u32)> {
        let x0 = rect.x.max(0) as i64;
        let y0 = rect.y.max(0) as i64;
        let x1 = (rect.x as i64 + rect.width as i64).min(self.width as i64);
        let y1 = (rect.y as i64 + rect.height as i64).min(self.height as i64);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }

    fn blend_at(&mut self, x: u32, y: u32, src: [u8; 4], opacity: u16) {
        let alpha = mul_div255(src[3] as u16, opacity);
        if alpha == 0 {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        let px = &mut self.data[idx..idx + 4];
        let inv = 255 - alpha;
        for c in 0..3 {
            px[c] = (mul_div255(src[c] as u16, alpha) + mul_div255(px[c] as u16, inv)).min(255) as u8;
        }
        px[3] = 255;
    }

    fn fill_rect(&mut self, rect: Rect, color: Rgba, opacity: u16) {
        let Some((x0, y0, x1, y1)) = self.clip_to_canvas(rect) else {
            return;
        };
        for y in y0..y1 {
            for x in x0..x1 {
                self.blend_at(x, y, color.0, opacity);
            }
        }
    }

    /// Nearest-neighbour scale of `image` into `rect`.
    fn draw_image(&mut self, rect: Rect, image: &RgbaImage, opacity: u16) {
        let Some((x0, y0, x1, y1)) = self.clip_to_canvas(rect) else {
            return;
        };
        let (iw, ih) = image.dimensions();
        if iw == 0 || ih == 0 {
            return;
        }
        for y in y0..y1 {
            let v = (y as i64 - rect.y as i64) as u64 * ih as u64 / rect.height as u64;
            for x in x0..x1 {
                let u = (x as i64 - rect.x as i64) as u64 * iw as u64 / rect.width as u64;
                let src = image.get_pixel(u.min(iw as u64 - 1) as u32, v.min(ih as u64 - 1) as u32);
                self.blend_at(x, y, src.0, opacity);
            }
        }
    }
}

/// `x * y / 255` rounded, for `x, y <= 255`.
fn mul_div255(x: u16, y: u16) -> u16 {
    let t = x as u32 * y as u32 + 128;
    ((t + (t >> 8)) >> 8) as u16
}
