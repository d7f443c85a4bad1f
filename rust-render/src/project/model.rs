//! Serializable project specification carried in a job payload.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Largest accepted canvas edge, in pixels.
pub const MAX_DIMENSION: u32 = 8192;

/// Largest accepted frame rate.
pub const MAX_FPS: u32 = 240;

/// A timeline project: canvas geometry plus ordered layers of clips.
///
/// Layers are composited bottom-to-top in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Explicit length; defaults to the end of the last clip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_frames: Option<u64>,
    #[serde(default = "Rgba::black")]
    pub background: Rgba,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clips: Vec<Clip>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    #[serde(default)]
    pub id: String,
    /// First frame (inclusive) on the project timeline.
    pub start_frame: u64,
    pub duration_frames: u64,
    pub source: ClipSource,
    /// Placement; defaults to the full canvas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<Rect>,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
}

impl Clip {
    /// One past the last frame the clip covers.
    pub fn end_frame(&self) -> u64 {
        self.start_frame.saturating_add(self.duration_frames)
    }

    pub fn is_visible_at(&self, frame: u64) -> bool {
        frame >= self.start_frame && frame < self.end_frame()
    }
}

fn default_opacity() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClipSource {
    /// Flat color fill.
    Solid { color: Rgba },
    /// Still image; `asset` is resolved against the asset root.
    Image { asset: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ProjectSpec {
    /// Number of frames the project renders.
    pub fn frame_count(&self) -> u64 {
        self.duration_frames.unwrap_or_else(|| {
            self.layers
                .iter()
                .flat_map(|l| l.clips.iter())
                .map(Clip::end_frame)
                .max()
                .unwrap_or(0)
        })
    }

    /// Structural validation; asset existence is checked during resolution.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid_project("width and height must be non-zero"));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(Error::invalid_project(format!(
                "canvas {}x{} exceeds the {} pixel limit",
                self.width, self.height, MAX_DIMENSION
            )));
        }
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(Error::invalid_project(format!(
                "fps must be between 1 and {}",
                MAX_FPS
            )));
        }

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            for (clip_idx, clip) in layer.clips.iter().enumerate() {
                let label = clip_label(layer_idx, layer, clip_idx, clip);
                if clip.duration_frames == 0 {
                    return Err(Error::invalid_project(format!(
                        "{} has zero duration",
                        label
                    )));
                }
                if !(0.0..=1.0).contains(&clip.opacity) {
                    return Err(Error::invalid_project(format!(
                        "{} opacity must be within [0, 1]",
                        label
                    )));
                }
                if let Some(rect) = clip.rect
                    && (rect.width == 0 || rect.height == 0)
                {
                    return Err(Error::invalid_project(format!(
                        "{} has an empty rect",
                        label
                    )));
                }
                if let ClipSource::Image { asset } = &clip.source
                    && asset.trim().is_empty()
                {
                    return Err(Error::invalid_project(format!(
                        "{} has an empty asset reference",
                        label
                    )));
                }
            }
        }

        if self.frame_count() == 0 {
            return Err(Error::invalid_project("project renders zero frames"));
        }

        Ok(())
    }

    /// Size of one RGBA8 frame in bytes.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

fn clip_label(layer_idx: usize, layer: &Layer, clip_idx: usize, clip: &Clip) -> String {
    let layer_name = if layer.id.is_empty() {
        format!("layer #{}", layer_idx)
    } else {
        format!("layer '{}'", layer.id)
    };
    if clip.id.is_empty() {
        format!("{} clip #{}", layer_name, clip_idx)
    } else {
        format!("{} clip '{}'", layer_name, clip.id)
    }
}

/// Straight-alpha RGBA8 color, written as `#rrggbb` or `#rrggbbaa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub fn black() -> Self {
        Self([0, 0, 0, 255])
    }
}

impl FromStr for Rgba {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let hex = s
            .strip_prefix('#')
            .ok_or_else(|| format!("color '{}' must start with '#'", s))?;
        if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
            return Err(format!("color '{}' must be #rrggbb or #rrggbbaa", s));
        }

        let channel = |i: usize| {
            u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| format!("color '{}' has invalid hex digits", s))
        };
        let alpha = if hex.len() == 8 { channel(3)? } else { 255 };
        Ok(Self([channel(0)?, channel(1)?, channel(2)?, alpha]))
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.0;
        if a == 255 {
            write!(f, "#{:02x}{:02x}{:02x}", r, g, b)
        } else {
            write!(f, "#{:02x}{:02x}{:02x}{:02x}", r, g, b, a)
        }
    }
}

impl Serialize for Rgba {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rgba {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_clip(start: u64, len: u64) -> Clip {
        Clip {
            id: String::new(),
            start_frame: start,
            duration_frames: len,
            source: ClipSource::Solid {
                color: Rgba([255, 0, 0, 255]),
            },
            rect: None,
            opacity: 1.0,
        }
    }

    fn project(layers: Vec<Layer>) -> ProjectSpec {
        ProjectSpec {
            width: 4,
            height: 2,
            fps: 30,
            duration_frames: None,
            background: Rgba::black(),
            layers,
        }
    }

    #[test]
    fn test_parse_project_json() {
        let json = r##"{
            "width": 1, "height": 1, "fps": 1,
            "layers": [{"id": "bg", "clips": [
                {"start_frame": 0, "duration_frames": 3,
                 "source": {"type": "solid", "color": "#ff8000"}}
            ]}]
        }"##;
        let spec: ProjectSpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.frame_count(), 3);
        assert_eq!(spec.background, Rgba::black());
        assert_eq!(
            spec.layers[0].clips[0].source,
            ClipSource::Solid {
                color: Rgba([255, 128, 0, 255])
            }
        );
        spec.validate().unwrap();
    }

    #[test]
    fn test_frame_count_prefers_explicit_duration() {
        let mut spec = project(vec![Layer {
            id: "a".into(),
            clips: vec![solid_clip(2, 5)],
        }]);
        assert_eq!(spec.frame_count(), 7);
        spec.duration_frames = Some(3);
        assert_eq!(spec.frame_count(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut spec = project(vec![Layer {
            id: String::new(),
            clips: vec![solid_clip(0, 1)],
        }]);
        spec.fps = 0;
        assert!(matches!(spec.validate(), Err(Error::InvalidProject(_))));

        spec.fps = 30;
        spec.width = MAX_DIMENSION + 1;
        assert!(matches!(spec.validate(), Err(Error::InvalidProject(_))));
    }

    #[test]
    fn test_validate_names_offending_clip() {
        let mut clip = solid_clip(0, 0);
        clip.id = "title".into();
        let spec = project(vec![Layer {
            id: "text".into(),
            clips: vec![clip],
        }]);

        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("layer 'text' clip 'title'"));
    }

    #[test]
    fn test_empty_project_is_invalid() {
        let spec = project(vec![]);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_color_parsing() {
        assert_eq!("#000000".parse::<Rgba>().unwrap(), Rgba([0, 0, 0, 255]));
        assert_eq!(
            "#11223344".parse::<Rgba>().unwrap(),
            Rgba([0x11, 0x22, 0x33, 0x44])
        );
        assert!("112233".parse::<Rgba>().is_err());
        assert!("#12345".parse::<Rgba>().is_err());
        assert!("#gg0000".parse::<Rgba>().is_err());
        assert_eq!(Rgba([1, 2, 3, 4]).to_string(), "#01020304");
    }
}
