use std::borrow::Cow;

use rkyv::util::AlignedVec;

use crate::commands::{Command, ReturnCommand};

/// Wire protocol magic bytes: "GW"
pub const MAGIC: [u8; 2] = [0x47, 0x57];

/// Maximum frame payload size: 256 MB
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Frame header size in bytes: magic(2) + flags(1) + length(4) = 7
pub const HEADER_SIZE: usize = 7;

/// Minimum payload size to attempt LZ4 compression (bytes).
/// Payloads smaller than this are sent uncompressed to avoid overhead.
const COMPRESSION_THRESHOLD: usize = 512;

bitflags::bitflags! {
    /// Frame flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const COMPRESSED = 0b0000_0001;
        /// Server to client.
        const RETURN     = 0b0000_0010;
    }
}

/// One complete frame located at the front of a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub flags: FrameFlags,
    pub payload: &'a [u8],
    /// Header plus payload, in bytes.
    pub frame_len: usize,
}

/// Encode a client command into a frame.
pub fn encode_command(cmd: &Command) -> Result<Vec<u8>, WireError> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(cmd)
        .map_err(|e| WireError::Serialization(e.to_string()))?;
    encode_frame(&payload, FrameFlags::empty())
}

/// Encode a server return command into a frame.
pub fn encode_return_command(cmd: &ReturnCommand) -> Result<Vec<u8>, WireError> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(cmd)
        .map_err(|e| WireError::Serialization(e.to_string()))?;
    encode_frame(&payload, FrameFlags::RETURN)
}

fn encode_frame(payload: &[u8], direction: FrameFlags) -> Result<Vec<u8>, WireError> {
    // Attempt LZ4 compression for payloads above threshold
    let (final_payload, compression_flag) = if payload.len() > COMPRESSION_THRESHOLD {
        let compressed = lz4_flex::compress_prepend_size(payload);
        if compressed.len() < payload.len() {
            (Cow::Owned(compressed), FrameFlags::COMPRESSED)
        } else {
            (Cow::Borrowed(payload), FrameFlags::empty())
        }
    } else {
        (Cow::Borrowed(payload), FrameFlags::empty())
    };

    let payload_len = u32::try_from(final_payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(WireError::FrameTooLarge(final_payload.len() as u64))?;

    let flags = compression_flag | direction;
    let mut frame = Vec::with_capacity(HEADER_SIZE + final_payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.push(flags.bits());
    frame.extend_from_slice(&payload_len.to_le_bytes());
    frame.extend_from_slice(&final_payload);

    Ok(frame)
}

/// Decode a frame header. Returns (flags, payload_length).
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(FrameFlags, u32), WireError> {
    if header[0] != MAGIC[0] || header[1] != MAGIC[1] {
        return Err(WireError::InvalidMagic);
    }

    let flags = FrameFlags::from_bits(header[2]).ok_or(WireError::UnknownFlags(header[2]))?;
    let length = u32::from_le_bytes([header[3], header[4], header[5], header[6]]);

    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(length as u64));
    }

    Ok((flags, length))
}

/// Locate the first frame of `bytes`. Returns `Ok(None)` when the buffer
/// holds only part of a frame; the caller keeps those bytes for later.
pub fn next_frame(bytes: &[u8]) -> Result<Option<RawFrame<'_>>, WireError> {
    let Some(header) = bytes.first_chunk::<HEADER_SIZE>() else {
        // A wrong magic is reported as soon as it is visible.
        if bytes.len() >= MAGIC.len() && bytes[..MAGIC.len()] != MAGIC {
            return Err(WireError::InvalidMagic);
        }
        return Ok(None);
    };
    let (flags, length) = decode_header(header)?;
    let frame_len = HEADER_SIZE + length as usize;
    if bytes.len() < frame_len {
        return Ok(None);
    }
    Ok(Some(RawFrame {
        flags,
        payload: &bytes[HEADER_SIZE..frame_len],
        frame_len,
    }))
}

/// Decode a client command from a frame.
pub fn decode_command(frame: &RawFrame<'_>) -> Result<Command, WireError> {
    if frame.flags.contains(FrameFlags::RETURN) {
        return Err(WireError::WrongDirection);
    }
    let data = payload_bytes(frame)?;
    rkyv::from_bytes::<Command, rkyv::rancor::Error>(&data)
        .map_err(|e| WireError::Serialization(e.to_string()))
}

/// Decode a server return command from a frame.
pub fn decode_return_command(frame: &RawFrame<'_>) -> Result<ReturnCommand, WireError> {
    if !frame.flags.contains(FrameFlags::RETURN) {
        return Err(WireError::WrongDirection);
    }
    let data = payload_bytes(frame)?;
    rkyv::from_bytes::<ReturnCommand, rkyv::rancor::Error>(&data)
        .map_err(|e| WireError::Serialization(e.to_string()))
}

/// Decompresses if needed and copies into an aligned buffer; a payload
/// sliced out of a larger stream has no alignment guarantee.
fn payload_bytes(frame: &RawFrame<'_>) -> Result<AlignedVec, WireError> {
    let data: Cow<'_, [u8]> = if frame.flags.contains(FrameFlags::COMPRESSED) {
        let size = frame
            .payload
            .first_chunk::<4>()
            .map(|prefix| u32::from_le_bytes(*prefix))
            .ok_or_else(|| WireError::DecompressionError("missing size prefix".into()))?;
        if size > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(size as u64));
        }
        Cow::Owned(
            lz4_flex::decompress_size_prepended(frame.payload)
                .map_err(|e| WireError::DecompressionError(e.to_string()))?,
        )
    } else {
        Cow::Borrowed(frame.payload)
    };
    let mut aligned = AlignedVec::with_capacity(data.len());
    aligned.extend_from_slice(&data);
    Ok(aligned)
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("unknown frame flags: {0:#04x}")]
    UnknownFlags(u8),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),
    #[error("frame sent in the wrong direction")]
    WrongDirection,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("decompression error: {0}")]
    DecompressionError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
