//! Encoder subprocess configuration.

use process_utils::piped_command;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::process::Command;

use crate::project::{MAX_DIMENSION, MAX_FPS};
use crate::render::FrameGeometry;
use crate::{Error, Result};

/// Export bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// ffmpeg executable name or path.
    pub ffmpeg_path: String,
    /// Maximum wait for one command acknowledgment.
    pub ack_timeout_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ack_timeout_ms: 30_000,
        }
    }
}

/// Geometry carried by the `start` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl EncoderSettings {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(Error::Encoder(format!(
                "unsupported frame size {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(Error::Encoder(format!("unsupported frame rate {}", self.fps)));
        }
        Ok(())
    }

    /// Expected length of every frame submitted to the session.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl From<FrameGeometry> for EncoderSettings {
    fn from(g: FrameGeometry) -> Self {
        Self {
            width: g.width,
            height: g.height,
            fps: g.fps,
        }
    }
}

/// Builds the subprocess that turns raw RGBA8 frames on stdin into a file.
///
/// The returned command must read frames from stdin until EOF and write the
/// encoded result to `output`.
pub trait EncoderBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// File name of the encoded output inside the job workspace.
    fn output_file_name(&self) -> &str;

    fn command(&self, settings: &EncoderSettings, output: &Path) -> Command;
}

/// H.264/MP4 via ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg_path: String,
}

impl FfmpegBackend {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn from_config(config: &ExportConfig) -> Self {
        Self::new(config.ffmpeg_path.clone())
    }

    /// Arguments for a given geometry, without the program name.
    pub fn args(settings: &EncoderSettings, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("-s".to_string());
        args.push(format!("{}x{}", settings.width, settings.height));
        args.push("-r".to_string());
        args.push(settings.fps.to_string());
        args.extend(["-i", "pipe:0", "-an"].iter().map(|s| s.to_string()));

        // yuv420p needs even dimensions.
        if settings.width % 2 != 0 || settings.height % 2 != 0 {
            args.push("-vf".to_string());
            args.push("pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string());
        }

        args.extend(
            [
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

impl EncoderBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn output_file_name(&self) -> &str {
        "output.mp4"
    }

    fn command(&self, settings: &EncoderSettings, output: &Path) -> Command {
        let mut cmd = piped_command(&self.ffmpeg_path);
        cmd.args(Self::args(settings, output));
        cmd
    }
}

/// Arbitrary encoder command.
///
/// Arguments may contain `{output}`, `{width}`, `{height}` and `{fps}`
/// placeholders, substituted when the session starts.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    output_file: String,
}

impl CommandBackend {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            output_file: "output.bin".to_string(),
        }
    }

    /// Run `script` with `sh -c`; the output path is passed as `$0`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", ["-c".to_string(), script.into(), "{output}".to_string()])
    }

    pub fn with_output_file(mut self, name: impl Into<String>) -> Self {
        self.output_file = name.into();
        self
    }
}

impl EncoderBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn output_file_name(&self) -> &str {
        &self.output_file
    }

    fn command(&self, settings: &EncoderSettings, output: &Path) -> Command {
        let output = output.to_string_lossy();
        let mut cmd = piped_command(&self.program);
        for arg in &self.args {
            cmd.arg(
                arg.replace("{output}", &output)
                    .replace("{width}", &settings.width.to_string())
                    .replace("{height}", &settings.height.to_string())
                    .replace("{fps}", &settings.fps.to_string()),
            );
        }
        cmd
    }
}
