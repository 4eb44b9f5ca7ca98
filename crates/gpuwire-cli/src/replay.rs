use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use gpuwire_core::{MemoryTransferMode, WireConfig};
use gpuwire_protocol::{wire, ObjectHandle, ObjectType};
use gpuwire_server::{NullBackend, Server};
use gpuwire_transport::loopback;
use gpuwire_transport::trace::{read_trace, split_trace, TraceEntry};
use tracing::{debug, info};

/// Handles an embedding reserves before it sends anything: the first
/// instance and the first device. `gpuwire demo` records traces this way.
pub const INJECTED_INSTANCE: ObjectHandle = ObjectHandle::new(0, 0);
pub const INJECTED_DEVICE: ObjectHandle = ObjectHandle::new(0, 0);

/// What a replay did to the null backend.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub commands: usize,
    /// Return frames in the trace, which replay ignores.
    pub skipped_return_frames: usize,
    /// Return commands the server produced, by name.
    pub return_commands: BTreeMap<&'static str, usize>,
    /// Server objects still alive at the end, by type.
    pub live_objects: BTreeMap<&'static str, usize>,
}

impl ReplayReport {
    pub fn total_return_commands(&self) -> usize {
        self.return_commands.values().sum()
    }
}

pub fn replay_trace(path: impl AsRef<Path>, config: &WireConfig) -> anyhow::Result<ReplayReport> {
    let path = path.as_ref();
    let entries = read_trace(path).with_context(|| format!("reading trace {}", path.display()))?;
    info!(path = %path.display(), frames = entries.len(), "replaying trace");
    replay_entries(&entries, config)
}

/// Feed the client commands of a trace to a server on the null backend,
/// letting the backend finish its work after every command.
pub fn replay_entries(entries: &[TraceEntry], config: &WireConfig) -> anyhow::Result<ReplayReport> {
    if config.server.memory_transfer == MemoryTransferMode::Shared {
        bail!("shared memory regions are not recorded in traces; replay needs server.memory_transfer = \"inline\"");
    }

    let (serializer, mut returns) = loopback::channel(config.server.max_allocation_size);
    let backend = NullBackend::new();
    let mut server = Server::new(backend.clone(), serializer);
    server.inject_instance(backend.create_instance(), INJECTED_INSTANCE)?;
    server.inject_device(backend.create_device(), INJECTED_DEVICE)?;

    let mut report = ReplayReport::default();
    for entry in entries {
        if entry.is_return() {
            report.skipped_return_frames += 1;
            continue;
        }
        let rest = server
            .handle_commands(&entry.frame)
            .with_context(|| format!("command frame at offset {}", entry.offset))?;
        if !rest.is_empty() {
            bail!("frame at offset {} left {} bytes unhandled", entry.offset, rest.len());
        }
        report.commands += 1;
        server.process_events();
        server.flush().context("flushing return commands")?;
    }

    for frame in split_trace(&returns.take_bytes())? {
        let Some(raw) = wire::next_frame(&frame.frame)? else {
            continue;
        };
        let command = wire::decode_return_command(&raw)?;
        *report.return_commands.entry(command.name()).or_default() += 1;
    }
    for object_type in ObjectType::ALL {
        let count = server.object_count(object_type);
        if count > 0 {
            report.live_objects.insert(object_type.name(), count);
        }
    }
    debug!(?report, "replay finished");
    Ok(report)
}

pub fn print_report(report: &ReplayReport) {
    println!("Replayed {} commands ({} return frames skipped)", report.commands, report.skipped_return_frames);
    println!();
    println!("Return commands: {}", report.total_return_commands());
    for (name, count) in &report.return_commands {
        println!("  {:<40} {}", name, count);
    }
    println!();
    if report.live_objects.is_empty() {
        println!("No server objects left alive");
    } else {
        println!("Server objects still alive:");
        for (name, count) in &report.live_objects {
            println!("  {:<40} {}", name, count);
        }
    }
}
