//! Demultiplexing of the sandbox's combined stdout/stderr stream.
//!
//! The runtime multiplexes both stdio streams over one byte stream as
//! back-to-back frames. Each frame starts with an 8-byte header: byte 0 is
//! the stream tag (1 = stdout, 2 = stderr), bytes 1-3 are reserved, bytes
//! 4-7 hold the payload length as a big-endian u32. The payload follows
//! immediately.

use crate::sandbox::OutputStream;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use tracing::warn;

pub const STDOUT_TAG: u8 = 1;
pub const STDERR_TAG: u8 = 2;

const FRAME_HEADER_LEN: usize = 8;

/// One demultiplexed chunk of sandbox stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioFrame {
    pub tag: u8,
    pub data: Bytes,
}

impl StdioFrame {
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            tag: STDOUT_TAG,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            tag: STDERR_TAG,
            data: data.into(),
        }
    }
}

/// Incremental decoder for the framed wire format. Chunks may split headers
/// and payloads arbitrarily; a partial frame left at end-of-stream is
/// discarded with the decoder, without erroring.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StdioFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buf.len() >= FRAME_HEADER_LEN {
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < FRAME_HEADER_LEN + len {
                break;
            }
            let tag = self.buf[0];
            self.buf.advance(FRAME_HEADER_LEN);
            let data = self.buf.split_to(len).freeze();
            frames.push(StdioFrame { tag, data });
        }
        frames
    }
}

/// Growing stdout/stderr buffers with the truncation cap applied during
/// append: the first `cap` bytes of each stream are kept, the rest dropped
/// silently. Unknown tags are discarded for forward compatibility.
#[derive(Debug)]
pub struct OutputBuffers {
    cap: usize,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl OutputBuffers {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn append(&mut self, tag: u8, data: &[u8]) {
        let buf = match tag {
            STDOUT_TAG => &mut self.stdout,
            STDERR_TAG => &mut self.stderr,
            _ => return,
        };
        if buf.len() >= self.cap {
            return;
        }
        let take = data.len().min(self.cap - buf.len());
        buf.extend_from_slice(&data[..take]);
    }
}

/// Drains an attach stream to completion. Read errors end the drain without
/// failing the job; whatever arrived before the error is kept.
pub async fn collect(mut stream: OutputStream, cap: usize) -> OutputBuffers {
    let mut buffers = OutputBuffers::new(cap);
    while let Some(item) = stream.next().await {
        match item {
            Ok(frame) => buffers.append(frame.tag, &frame.data),
            Err(e) => {
                warn!(error = %e, "sandbox output stream read failed");
                break;
            }
        }
    }
    buffers
}
