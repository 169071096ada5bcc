//! Blocking byte stream handed to the video player.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use super::queue::OutputQueue;

/// Requests the player thread sends back to the transporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    /// Restart delivery from this byte of the file
    Seek(u64),
    /// Player is gone
    Close,
}

/// Reader end of the output queue.
///
/// Reads block until the reactor pushes the next piece. Seeking clears the
/// queue at once and asks the transporter to restart from the new position
/// on its next tick.
pub struct PlayerStream {
    queue: Arc<OutputQueue>,
    commands: mpsc::UnboundedSender<StreamCommand>,
    current: Bytes,
    position: u64,
    length: Option<u64>,
    closed: bool,
}

impl PlayerStream {
    pub(crate) fn new(
        queue: Arc<OutputQueue>,
        commands: mpsc::UnboundedSender<StreamCommand>,
        position: u64,
        length: Option<u64>,
    ) -> Self {
        Self {
            queue,
            commands,
            current: Bytes::new(),
            position,
            length,
            closed: false,
        }
    }

    /// Byte offset of the next read within the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// File length; `None` for a live stream.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Stops delivery. Further reads return end of stream.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.current.clear();
            let _ = self.commands.send(StreamCommand::Close);
        }
    }
}

impl fmt::Debug for PlayerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerStream")
            .field("position", &self.position)
            .field("length", &self.length)
            .field("buffered", &self.current.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Read for PlayerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed || buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.queue.pop() {
                Some((_, data)) => self.current = data,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for PlayerStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let length = self.length.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "live stream has no end")
                })?;
                length.checked_add_signed(delta)
            }
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file"))?;

        if let Some(length) = self.length
            && target > length
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {target} past end of file ({length} bytes)"),
            ));
        }
        if target == self.position {
            return Ok(target);
        }

        self.queue.request_seek();
        self.commands
            .send(StreamCommand::Seek(target))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transporter stopped"))?;
        self.current.clear();
        self.position = target;
        Ok(target)
    }
}

impl Drop for PlayerStream {
    fn drop(&mut self) {
        self.close();
    }
}
