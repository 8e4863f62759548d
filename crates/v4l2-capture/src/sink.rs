//! Frame sinks

use std::io::{self, Write};

use tokio::sync::mpsc;

/// Synchronous consumer of completed frames.
///
/// `write_frame` blocks until the frame is consumed. Frames arrive in capture
/// order and the slice is only valid for the duration of the call.
pub trait Sink {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).write_frame(frame)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).write_frame(frame)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Writes every frame, whole and in order, to a [`Write`] implementation
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    writer: W,
    frames: u64,
    bytes: u64,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for WriterSink<W> {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame)?;
        self.frames += 1;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Forwards an owned copy of each frame to an async consumer.
///
/// The channel is bounded and `write_frame` uses `blocking_send`, so a
/// consumer that falls behind throttles capture just like a slow file. Must
/// be driven from a blocking thread, never from inside the runtime.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelSink {
    /// Create a sink and the receiver the consumer reads frames from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .blocking_send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame receiver dropped"))
    }
}
