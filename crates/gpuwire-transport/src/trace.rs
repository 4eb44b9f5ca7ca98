use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use gpuwire_protocol::wire::{self, FrameFlags};
use tracing::{info, warn};

use crate::error::TransportError;
use crate::serializer::CommandSerializer;

/// Wraps a serializer and mirrors every byte it forwards to a writer.
///
/// Space handed out by `get_cmd_space` is staged locally and forwarded to the
/// inner serializer on the next allocation or flush, once its contents are
/// final. Mirror failures are logged and disable mirroring; they never change
/// what reaches the inner serializer.
pub struct TraceSerializer<S, W: Write = BufWriter<File>> {
    inner: S,
    mirror: Option<W>,
    staged: Vec<u8>,
    mirrored_bytes: u64,
}

impl<S: CommandSerializer> TraceSerializer<S> {
    /// Mirror into a new file at `path`, creating parent directories.
    pub fn create(inner: S, path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        info!(path = %path.display(), "mirroring wire traffic");
        Ok(Self::new(inner, BufWriter::new(file)))
    }
}

impl<S: CommandSerializer, W: Write> TraceSerializer<S, W> {
    pub fn new(inner: S, mirror: W) -> Self {
        Self {
            inner,
            mirror: Some(mirror),
            staged: Vec::new(),
            mirrored_bytes: 0,
        }
    }

    fn forward_staged(&mut self) -> bool {
        if self.staged.is_empty() {
            return true;
        }
        let forwarded = match self.inner.get_cmd_space(self.staged.len()) {
            Some(space) => {
                space.copy_from_slice(&self.staged);
                true
            }
            None => false,
        };
        if forwarded {
            self.mirror_bytes();
        }
        self.staged.clear();
        forwarded
    }

    fn mirror_bytes(&mut self) {
        let Some(mirror) = self.mirror.as_mut() else {
            return;
        };
        match mirror.write_all(&self.staged) {
            Ok(()) => self.mirrored_bytes += self.staged.len() as u64,
            Err(e) => {
                warn!(error = %e, "wire trace write failed, mirroring disabled");
                self.mirror = None;
            }
        }
    }

    /// Total bytes written to the mirror.
    pub fn mirrored_bytes(&self) -> u64 {
        self.mirrored_bytes
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Forward staged bytes and hand back the inner serializer and mirror.
    pub fn into_parts(mut self) -> (S, Option<W>) {
        self.forward_staged();
        if let Some(mirror) = self.mirror.as_mut() {
            let _ = mirror.flush();
        }
        (self.inner, self.mirror)
    }
}

impl<S: CommandSerializer, W: Write> CommandSerializer for TraceSerializer<S, W> {
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        if size > self.inner.maximum_allocation_size() || !self.forward_staged() {
            return None;
        }
        self.staged.resize(size, 0);
        Some(&mut self.staged[..])
    }

    fn flush(&mut self) -> bool {
        let forwarded = self.forward_staged();
        if let Some(mirror) = self.mirror.as_mut() {
            if let Err(e) = mirror.flush() {
                warn!(error = %e, "wire trace flush failed, mirroring disabled");
                self.mirror = None;
            }
        }
        forwarded && self.inner.flush()
    }

    fn maximum_allocation_size(&self) -> usize {
        self.inner.maximum_allocation_size()
    }
}

/// One frame read back from a trace file.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    /// Byte offset of the frame within the trace.
    pub offset: usize,
    pub flags: FrameFlags,
    /// Raw frame bytes, header included.
    pub frame: Vec<u8>,
}

impl TraceEntry {
    pub fn is_return(&self) -> bool {
        self.flags.contains(FrameFlags::RETURN)
    }
}

/// Split a recorded trace into frames.
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<TraceEntry>, TransportError> {
    let bytes = std::fs::read(path)?;
    split_trace(&bytes)
}

pub fn split_trace(bytes: &[u8]) -> Result<Vec<TraceEntry>, TransportError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let Some(frame) = wire::next_frame(&bytes[offset..])? else {
            return Err(TransportError::TruncatedTrace(bytes.len() - offset));
        };
        entries.push(TraceEntry {
            offset,
            flags: frame.flags,
            frame: bytes[offset..offset + frame.frame_len].to_vec(),
        });
        offset += frame.frame_len;
    }
    Ok(entries)
}
