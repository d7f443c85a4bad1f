//! Export bridge: streams rendered frames into an encoder subprocess.

mod bridge;
mod encoder;
mod frame_buffer;
mod protocol;
mod session;

pub use bridge::{ExportBridge, MSG_ALREADY_STARTED, MSG_NOT_STARTED, MSG_SESSION_CLOSED};
pub use encoder::{CommandBackend, EncoderBackend, EncoderSettings, ExportConfig, FfmpegBackend};
pub use frame_buffer::FrameBufferAdapter;
pub use protocol::{
    AckMessage, AckStatus, ExportCommand, METHOD_END, METHOD_HANDLE_FRAME, METHOD_START,
    RawCommand, RenderResult,
};
pub use session::{ExportOutput, ExporterSession};
