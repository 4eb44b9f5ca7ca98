use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Context};
use gpuwire_client::{Client, Device, WireObject};
use gpuwire_core::{MemoryTransferMode, SharedRegionPool, WireConfig};
use gpuwire_protocol::types::{
    BufferDescriptor, BufferUsage, CreatePipelineAsyncStatus, DeviceDescriptor, DeviceLostReason, ErrorType,
    MapAsyncStatus, MapMode, QueueWorkDoneStatus, RequestAdapterOptions, RequestAdapterStatus, RequestDeviceStatus,
    ShaderModuleDescriptor,
};
use gpuwire_protocol::ObjectType;
use gpuwire_server::{NullBackend, Server};
use gpuwire_transport::loopback::{self, LoopbackReceiver};
use gpuwire_transport::{CommandSerializer, TraceSerializer};
use tracing::{info, warn};

const READ_VALUE: u32 = 31337;
const WRITE_VALUE: u32 = 4242;

const DOUBLE_SHADER: &str = "\
@group(0) @binding(0) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = data[id.x] * 2u;
}
";

/// Outcome of one demo session.
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub memory_transfer: MemoryTransferMode,
    pub adapter: String,
    pub read_value: u32,
    pub written_value: u32,
    pub pipeline: CreatePipelineAsyncStatus,
    pub work_done: QueueWorkDoneStatus,
    /// Server objects left after everything was released.
    pub leaked_objects: usize,
    pub client_trace: Option<PathBuf>,
    pub server_trace: Option<PathBuf>,
}

/// Run a client and a server in this process over loopback transports with
/// the null backend, exercising adapters, devices, buffer mapping in both
/// directions, pipelines and queues.
///
/// Traces go to `trace_dir` when given, otherwise to the configured trace
/// directory when tracing is enabled.
pub fn run_demo(config: &WireConfig, trace_dir: Option<PathBuf>) -> anyhow::Result<DemoReport> {
    let trace_paths = match trace_dir {
        Some(dir) => Some((dir.join("client.gwtrace"), dir.join("server.gwtrace"))),
        None if config.trace.enabled => Some((config.trace.trace_path("client"), config.trace.trace_path("server"))),
        None => None,
    };

    match (config.client.memory_transfer, config.server.memory_transfer) {
        (MemoryTransferMode::Inline, MemoryTransferMode::Inline) => run_session(
            config,
            trace_paths,
            gpuwire_client::InlineMemoryTransferService,
            gpuwire_server::InlineMemoryTransferService,
        ),
        (MemoryTransferMode::Shared, MemoryTransferMode::Shared) => {
            let pool = SharedRegionPool::new();
            run_session(
                config,
                trace_paths,
                gpuwire_client::SharedMemoryTransferService::new(pool.clone()),
                gpuwire_server::SharedMemoryTransferService::new(pool),
            )
        }
        (client, server) => {
            bail!("client memory transfer {client:?} does not match server memory transfer {server:?}")
        }
    }
}

fn serializer(
    sender: loopback::LoopbackSerializer,
    trace: Option<&PathBuf>,
) -> anyhow::Result<Box<dyn CommandSerializer>> {
    Ok(match trace {
        Some(path) => Box::new(
            TraceSerializer::create(sender, path).with_context(|| format!("creating trace {}", path.display()))?,
        ),
        None => Box::new(sender),
    })
}

struct Session<CM, SM>
where
    CM: gpuwire_client::MemoryTransferService,
    SM: gpuwire_server::MemoryTransferService,
{
    client: Client<CM>,
    server: Server<NullBackend, SM>,
    to_server: LoopbackReceiver,
    to_client: LoopbackReceiver,
}

impl<CM, SM> Session<CM, SM>
where
    CM: gpuwire_client::MemoryTransferService,
    SM: gpuwire_server::MemoryTransferService,
{
    /// One round trip: client commands in, backend work done, replies out.
    fn pump(&mut self) -> anyhow::Result<()> {
        self.client.flush()?;
        self.to_server.deliver(&mut self.server)?;
        self.server.process_events();
        self.server.flush()?;
        self.to_client.deliver(&mut self.client)?;
        Ok(())
    }
}

type Outcome<T> = Rc<RefCell<Option<T>>>;

fn outcome<T>() -> Outcome<T> {
    Rc::new(RefCell::new(None))
}

fn run_session<CM, SM>(
    config: &WireConfig,
    trace_paths: Option<(PathBuf, PathBuf)>,
    client_transfer: CM,
    server_transfer: SM,
) -> anyhow::Result<DemoReport>
where
    CM: gpuwire_client::MemoryTransferService + 'static,
    SM: gpuwire_server::MemoryTransferService,
{
    let (client_tx, to_server) = loopback::channel(config.client.max_allocation_size);
    let (server_tx, to_client) = loopback::channel(config.server.max_allocation_size);
    let backend = NullBackend::new();
    let mut session = Session {
        client: Client::with_memory_transfer(
            serializer(client_tx, trace_paths.as_ref().map(|(client, _)| client))?,
            client_transfer,
        ),
        server: Server::with_memory_transfer(
            backend.clone(),
            serializer(server_tx, trace_paths.as_ref().map(|(_, server)| server))?,
            server_transfer,
        ),
        to_server,
        to_client,
    };

    // The embedding hands the client an instance and a device up front.
    let instance = session.client.reserve_instance();
    session.server.inject_instance(backend.create_instance(), instance.handle)?;
    let injected_device = session.client.reserve_device();
    session
        .server
        .inject_device(backend.create_device(), injected_device.handle)?;

    // ── Adapter and device ──────────────────────────────────

    let adapter_result = outcome();
    let slot = adapter_result.clone();
    session.client.instance_request_adapter(
        instance.object,
        &RequestAdapterOptions::default(),
        move |_, status, adapter, message| *slot.borrow_mut() = Some((status, adapter, message.to_owned())),
    );
    session.pump()?;
    let adapter = match adapter_result.take() {
        Some((RequestAdapterStatus::Success, Some(adapter), _)) => adapter,
        Some((status, _, message)) => bail!("adapter request failed with {status:?}: {message}"),
        None => bail!("adapter request did not complete"),
    };
    let adapter_name = session.client.adapter_info(adapter)?.description;
    info!(adapter = %adapter_name, "adapter acquired");

    let device_result = outcome();
    let slot = device_result.clone();
    session
        .client
        .adapter_request_device(adapter, &DeviceDescriptor::default(), move |_, status, device, message| {
            *slot.borrow_mut() = Some((status, device, message.to_owned()))
        });
    session.pump()?;
    let device = match device_result.take() {
        Some((RequestDeviceStatus::Success, Some(device), _)) => device,
        Some((status, _, message)) => bail!("device request failed with {status:?}: {message}"),
        None => bail!("device request did not complete"),
    };
    session.client.device_set_uncaptured_error_callback(
        device,
        Some(Box::new(|error_type: ErrorType, message: &str| warn!(?error_type, "uncaptured device error: {}", message))),
    )?;
    session.client.device_set_device_lost_callback(
        device,
        Some(Box::new(|_: &mut Client<CM>, device: Device, reason: DeviceLostReason, message: &str| {
            info!(%device, ?reason, "device lost: {}", message)
        })),
    )?;
    let queue = session.client.device_get_queue(device)?;

    // ── Read back through a mapping ─────────────────────────

    let read_buffer = session
        .client
        .device_create_buffer(device, &BufferDescriptor::new(4, BufferUsage::MAP_READ | BufferUsage::COPY_DST))?;
    session
        .client
        .queue_write_buffer(queue, read_buffer, 0, &READ_VALUE.to_le_bytes())?;
    let map_result = outcome();
    let slot = map_result.clone();
    session
        .client
        .buffer_map_async(read_buffer, MapMode::Read, 0, 4, move |_, status, message| {
            *slot.borrow_mut() = Some((status, message.to_owned()))
        });
    session.pump()?;
    match map_result.take() {
        Some((MapAsyncStatus::Success, _)) => {}
        Some((status, message)) => bail!("read mapping failed with {status:?}: {message}"),
        None => bail!("read mapping did not complete"),
    }
    let read_value = u32::from_le_bytes(
        session
            .client
            .buffer_get_const_mapped_range(read_buffer, 0, 4)?
            .try_into()?,
    );
    session.client.buffer_unmap(read_buffer)?;

    // ── Write through a mapping at creation ─────────────────

    let write_buffer = session.client.device_create_buffer(
        device,
        &BufferDescriptor {
            mapped_at_creation: true,
            ..BufferDescriptor::new(4, BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC)
        },
    )?;
    session
        .client
        .buffer_get_mapped_range(write_buffer, 0, 4)?
        .copy_from_slice(&WRITE_VALUE.to_le_bytes());
    session.client.buffer_unmap(write_buffer)?;
    session.pump()?;
    let native = session
        .server
        .native_handle(ObjectType::Buffer, write_buffer.handle())
        .context("write buffer has no native object")?;
    let contents = backend.buffer_contents(native).context("write buffer is gone")?;
    let written_value = u32::from_le_bytes(contents.as_slice().try_into()?);

    // ── Pipeline and queue ──────────────────────────────────

    let module = session.client.device_create_shader_module(
        device,
        &ShaderModuleDescriptor {
            label: Some("double".into()),
            code: DOUBLE_SHADER.into(),
        },
    )?;
    let pipeline_result = outcome();
    let slot = pipeline_result.clone();
    session.client.device_create_compute_pipeline_async(
        device,
        &gpuwire_client::ComputePipelineDescriptor {
            label: Some("double".into()),
            module,
            entry_point: "main".into(),
        },
        move |_, status, pipeline, _| *slot.borrow_mut() = Some((status, pipeline)),
    );
    let work_result = outcome();
    let slot = work_result.clone();
    session
        .client
        .queue_on_submitted_work_done(queue, move |_, status| *slot.borrow_mut() = Some(status));
    session.pump()?;
    let (pipeline_status, pipeline) = pipeline_result.take().context("pipeline creation did not complete")?;
    let work_done = work_result.take().context("queue work did not complete")?;

    // ── Teardown ────────────────────────────────────────────

    if let Some(pipeline) = pipeline {
        session.client.release(pipeline)?;
    }
    session.client.release(module)?;
    session.client.release(read_buffer)?;
    session.client.release(write_buffer)?;
    session.client.release(queue)?;
    session.client.release(device)?;
    session.client.release(adapter)?;
    session.client.release(injected_device.object)?;
    session.client.release(instance.object)?;
    session.pump()?;
    let leaked_objects = ObjectType::ALL
        .iter()
        .map(|object_type| session.server.object_count(*object_type))
        .sum();

    let (client_trace, server_trace) = trace_paths.unzip();
    Ok(DemoReport {
        memory_transfer: config.client.memory_transfer,
        adapter: adapter_name,
        read_value,
        written_value,
        pipeline: pipeline_status,
        work_done,
        leaked_objects,
        client_trace,
        server_trace,
    })
}

pub fn print_report(report: &DemoReport) {
    let check = |ok: bool| if ok { "\x1b[32m[PASS]\x1b[0m" } else { "\x1b[31m[FAIL]\x1b[0m" };
    println!("gpuwire demo ({:?} memory transfer)", report.memory_transfer);
    println!();
    println!("  Adapter:        {}", report.adapter);
    println!("  {} mapped read     {} (expected {})", check(report.read_value == READ_VALUE), report.read_value, READ_VALUE);
    println!(
        "  {} mapped write    {} (expected {})",
        check(report.written_value == WRITE_VALUE),
        report.written_value,
        WRITE_VALUE
    );
    println!("  {} pipeline        {:?}", check(report.pipeline == CreatePipelineAsyncStatus::Success), report.pipeline);
    println!("  {} work done       {:?}", check(report.work_done == QueueWorkDoneStatus::Success), report.work_done);
    println!("  {} leaked objects  {}", check(report.leaked_objects == 0), report.leaked_objects);
    if let (Some(client), Some(server)) = (&report.client_trace, &report.server_trace) {
        println!();
        println!("  Client trace:   {}", client.display());
        println!("  Server trace:   {}", server.display());
    }
}

impl DemoReport {
    pub fn passed(&self) -> bool {
        self.read_value == READ_VALUE
            && self.written_value == WRITE_VALUE
            && self.pipeline == CreatePipelineAsyncStatus::Success
            && self.work_done == QueueWorkDoneStatus::Success
            && self.leaked_objects == 0
    }
}
