//! Single-slot relay between frame production and the encoder's stdin.
//!
//! The producer pushes at most one frame at a time; the consumer pulls when
//! the encoder is ready for more. A push onto an occupied slot replaces the
//! pending frame, so producers that need every frame delivered use
//! [`FrameBufferAdapter::push_when_ready`].

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{Error, Result};

#[derive(Debug, Default)]
struct Slot {
    frame: Option<Bytes>,
    end_of_stream: bool,
    closed: bool,
}

/// One producer, one consumer, one pending frame.
#[derive(Debug, Default)]
pub struct FrameBufferAdapter {
    slot: Mutex<Slot>,
    filled: Notify,
    drained: Notify,
}

impl FrameBufferAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` in the slot, or signal end-of-stream with `None`.
    ///
    /// Returns `true` when a frame that had not been pulled yet was replaced.
    pub fn push_image(&self, frame: Option<Bytes>) -> Result<bool> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return Err(Error::Encoder("frame consumer is closed".to_string()));
        }
        if slot.end_of_stream {
            return Err(Error::Encoder("end of stream already signalled".to_string()));
        }

        let overwritten = match frame {
            Some(frame) => slot.frame.replace(frame).is_some(),
            None => {
                slot.end_of_stream = true;
                false
            }
        };
        drop(slot);

        self.filled.notify_one();
        Ok(overwritten)
    }

    /// Wait for the next frame. A frame pushed before end-of-stream is still
    /// delivered; `None` means the stream is finished or the adapter closed.
    pub async fn pull(&self) -> Option<Bytes> {
        loop {
            {
                let mut slot = self.slot.lock();
                if let Some(frame) = slot.frame.take() {
                    drop(slot);
                    self.drained.notify_one();
                    return Some(frame);
                }
                if slot.end_of_stream || slot.closed {
                    return None;
                }
            }
            self.filled.notified().await;
        }
    }

    /// Wait until the pending frame, if any, has been pulled.
    pub async fn wait_drained(&self) -> Result<()> {
        loop {
            {
                let slot = self.slot.lock();
                if slot.closed {
                    return Err(Error::Encoder("frame consumer is closed".to_string()));
                }
                if slot.frame.is_none() {
                    return Ok(());
                }
            }
            self.drained.notified().await;
        }
    }

    /// Push `frame` once the slot is free, so no frame is ever replaced.
    pub async fn push_when_ready(&self, frame: Bytes) -> Result<()> {
        self.wait_drained().await?;
        let overwritten = self.push_image(Some(frame))?;
        debug_assert!(!overwritten, "single producer must not race itself");
        Ok(())
    }

    /// Mark the consumer as gone. Pending data is dropped and later pushes fail.
    pub fn close(&self) {
        {
            let mut slot = self.slot.lock();
            slot.closed = true;
            slot.frame = None;
        }
        self.filled.notify_one();
        self.drained.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().frame.is_some()
    }
}
