use std::path::Path;

use anyhow::Context;
use gpuwire_protocol::wire::{self, FrameFlags};
use gpuwire_protocol::{Command, ReturnCommand};
use gpuwire_transport::trace::{read_trace, TraceEntry};
use serde::Serialize;

/// Which side of the wire wrote a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Commands from the client to the server
    Client,
    /// Return commands from the server to the client
    Server,
}

impl Direction {
    fn of(entry: &TraceEntry) -> Self {
        if entry.is_return() {
            Direction::Server
        } else {
            Direction::Client
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Decoded {
    Command(Command),
    Return(ReturnCommand),
}

impl Decoded {
    pub fn name(&self) -> &'static str {
        match self {
            Decoded::Command(command) => command.name(),
            Decoded::Return(command) => command.name(),
        }
    }
}

/// One frame of a trace, decoded as far as possible.
#[derive(Debug, Clone, Serialize)]
pub struct DumpedFrame {
    pub offset: usize,
    pub direction: Direction,
    pub compressed: bool,
    pub frame_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Decoded>,
    /// Decode failure, with the first bytes of the payload in hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decode every frame of the trace at `path`, optionally keeping only one
/// direction. Frames that fail to decode are reported, not skipped.
pub fn dump_trace(path: impl AsRef<Path>, direction: Option<Direction>) -> anyhow::Result<Vec<DumpedFrame>> {
    let path = path.as_ref();
    let entries = read_trace(path).with_context(|| format!("reading trace {}", path.display()))?;
    Ok(entries
        .iter()
        .filter(|entry| direction.is_none_or(|d| d == Direction::of(entry)))
        .map(dump_entry)
        .collect())
}

fn dump_entry(entry: &TraceEntry) -> DumpedFrame {
    let decoded = wire::next_frame(&entry.frame).and_then(|frame| {
        let Some(frame) = frame else {
            return Err(wire::WireError::Serialization("incomplete frame".into()));
        };
        if entry.is_return() {
            wire::decode_return_command(&frame).map(Decoded::Return)
        } else {
            wire::decode_command(&frame).map(Decoded::Command)
        }
    });
    let (command, error) = match decoded {
        Ok(command) => (Some(command), None),
        Err(e) => {
            let payload = entry.frame.get(wire::HEADER_SIZE..).unwrap_or_default();
            let preview = &payload[..payload.len().min(32)];
            (None, Some(format!("{e} (payload starts {})", hex::encode(preview))))
        }
    };
    DumpedFrame {
        offset: entry.offset,
        direction: Direction::of(entry),
        compressed: entry.flags.contains(FrameFlags::COMPRESSED),
        frame_len: entry.frame.len(),
        command,
        error,
    }
}

pub fn print_frames_pretty(frames: &[DumpedFrame]) {
    let mut failed = 0usize;
    for frame in frames {
        let direction = match frame.direction {
            Direction::Client => "->",
            Direction::Server => "<-",
        };
        let compressed = if frame.compressed { " lz4" } else { "" };
        match (&frame.command, &frame.error) {
            (Some(command), _) => {
                println!("{:>10} {} {:<40} {} bytes{}", frame.offset, direction, command.name(), frame.frame_len, compressed);
                println!("{:>13} {:?}", "", command);
            }
            (None, error) => {
                failed += 1;
                println!(
                    "{:>10} {} {:<40} {} bytes{}",
                    frame.offset,
                    direction,
                    "<undecodable>",
                    frame.frame_len,
                    compressed
                );
                println!("{:>13} {}", "", error.as_deref().unwrap_or_default());
            }
        }
    }
    println!("-------------------------------");
    println!("  {} frames, {} undecodable", frames.len(), failed);
}

/// One JSON object per line.
pub fn print_frames_json(frames: &[DumpedFrame]) -> anyhow::Result<()> {
    for frame in frames {
        println!("{}", serde_json::to_string(frame)?);
    }
    Ok(())
}
