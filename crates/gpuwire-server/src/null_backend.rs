//! A CPU-only [`Backend`] that keeps buffer contents in memory.
//!
//! Asynchronous requests queue up and complete on [`Backend::tick`]. Clones
//! share state, so a test can keep a clone to inspect and steer the backend
//! a server owns.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use gpuwire_protocol::types::{
    AdapterInfo, AdapterType, BackendType, BufferDescriptor, BufferUsage, CreatePipelineAsyncStatus,
    DeviceDescriptor, DeviceLostReason, ErrorFilter, ErrorType, Limits, LoggingType, MapAsyncStatus, MapMode,
    PopErrorScopeStatus, QueueWorkDoneStatus, RequestAdapterOptions, RequestAdapterStatus, RequestDeviceStatus,
    ShaderModuleDescriptor, TextureDescriptor,
};
use gpuwire_protocol::ObjectType;
use tracing::{debug, trace};

use crate::backend::{
    Backend, NativeCreatePipelineCallback, NativeDeviceLostCallback, NativeErrorCallback, NativeHandle,
    NativeLoggingCallback, NativeMapCallback, NativePopErrorScopeCallback, NativeRequestAdapterCallback,
    NativeRequestDeviceCallback, NativeWorkDoneCallback,
};

/// Map offsets must be a multiple of this.
pub const MAP_OFFSET_ALIGNMENT: u64 = 8;
/// Map sizes must be a multiple of this.
pub const MAP_SIZE_ALIGNMENT: u64 = 4;

pub const DEVICE_DESTROYED_MESSAGE: &str = "Device was destroyed.";

#[derive(Clone, Default)]
pub struct NullBackend {
    state: Rc<RefCell<NullState>>,
}

#[derive(Default)]
struct NullState {
    next_id: u64,
    objects: BTreeMap<NativeHandle, NullObject>,
    released: Vec<(ObjectType, NativeHandle)>,
    work: VecDeque<Work>,
    adapters_unavailable: bool,
    fail_next_map: Option<MapAsyncStatus>,
    fail_next_pipeline: bool,
}

struct NullObject {
    object_type: ObjectType,
    refcount: u32,
    device: Option<NativeHandle>,
    kind: NullKind,
}

enum NullKind {
    Plain,
    Device(NullDevice),
    Buffer(NullBuffer),
}

#[derive(Default)]
struct NullDevice {
    queue: Option<NativeHandle>,
    lost: bool,
    error_callback: Option<NativeErrorCallback>,
    logging_callback: Option<NativeLoggingCallback>,
    lost_callback: Option<NativeDeviceLostCallback>,
    /// Innermost scope last.
    error_scopes: Vec<ErrorScope>,
}

struct ErrorScope {
    filter: ErrorFilter,
    /// The first error the scope captured.
    error: Option<(ErrorType, String)>,
}

struct NullBuffer {
    data: Vec<u8>,
    usage: BufferUsage,
    mapped: Option<(u64, u64)>,
    map_pending: bool,
    destroyed: bool,
}

enum Work {
    Adapter {
        callback: NativeRequestAdapterCallback,
    },
    Device {
        required_limits: Option<Limits>,
        callback: NativeRequestDeviceCallback,
    },
    Pipeline {
        device: NativeHandle,
        fail: Option<String>,
        callback: NativeCreatePipelineCallback,
    },
    Map {
        buffer: NativeHandle,
        offset: u64,
        size: u64,
        /// Set when the request was rejected or cancelled.
        outcome: Option<(MapAsyncStatus, &'static str)>,
        callback: NativeMapCallback,
    },
    WorkDone {
        queue: NativeHandle,
        callback: NativeWorkDoneCallback,
    },
    PopErrorScope {
        device: NativeHandle,
        /// `None` when the stack was empty.
        scope: Option<ErrorScope>,
        callback: NativePopErrorScopeCallback,
    },
}

impl NullState {
    fn create(&mut self, object_type: ObjectType, device: Option<NativeHandle>, kind: NullKind) -> NativeHandle {
        self.next_id += 1;
        let native = NativeHandle(self.next_id);
        self.objects.insert(native, NullObject { object_type, refcount: 1, device, kind });
        trace!(%object_type, %native, "null object created");
        native
    }

    fn device(&mut self, native: NativeHandle) -> Option<&mut NullDevice> {
        match self.objects.get_mut(&native).map(|object| &mut object.kind) {
            Some(NullKind::Device(device)) => Some(device),
            _ => None,
        }
    }

    fn buffer(&mut self, native: NativeHandle) -> Option<&mut NullBuffer> {
        match self.objects.get_mut(&native).map(|object| &mut object.kind) {
            Some(NullKind::Buffer(buffer)) => Some(buffer),
            _ => None,
        }
    }

    fn device_of(&self, native: NativeHandle) -> Option<NativeHandle> {
        self.objects.get(&native).and_then(|object| object.device)
    }

    fn is_lost(&self, device: Option<NativeHandle>) -> bool {
        match device.and_then(|d| self.objects.get(&d)).map(|object| &object.kind) {
            Some(NullKind::Device(device)) => device.lost,
            _ => true,
        }
    }

    /// Resolve queued map requests on `buffer` with `status`.
    fn cancel_maps(&mut self, buffer: NativeHandle, status: MapAsyncStatus, message: &'static str) {
        for work in self.work.iter_mut() {
            if let Work::Map { buffer: b, outcome, .. } = work {
                if *b == buffer && outcome.is_none() {
                    *outcome = Some((status, message));
                }
            }
        }
        if let Some(data) = self.buffer(buffer) {
            data.map_pending = false;
        }
    }

    fn validate_map(&mut self, buffer: NativeHandle, mode: MapMode, offset: u64, size: u64) -> Option<(MapAsyncStatus, &'static str)> {
        if let Some(status) = self.fail_next_map.take() {
            return Some((status, "Map failure requested"));
        }
        let Some(data) = self.buffer(buffer) else {
            return Some((MapAsyncStatus::ValidationError, "Buffer is not live"));
        };
        let required = match mode {
            MapMode::Read => BufferUsage::MAP_READ,
            MapMode::Write => BufferUsage::MAP_WRITE,
        };
        if data.destroyed {
            return Some((MapAsyncStatus::DestroyedBeforeCallback, "Buffer is destroyed"));
        }
        if !data.usage.contains(required) {
            return Some((MapAsyncStatus::ValidationError, "Buffer usage does not allow this map mode"));
        }
        if offset % MAP_OFFSET_ALIGNMENT != 0 || size % MAP_SIZE_ALIGNMENT != 0 {
            return Some((MapAsyncStatus::ValidationError, "Map range is misaligned"));
        }
        if offset.checked_add(size).is_none_or(|end| end > data.data.len() as u64) {
            return Some((MapAsyncStatus::ValidationError, "Map range exceeds the buffer"));
        }
        if data.mapped.is_some() || data.map_pending {
            return Some((MapAsyncStatus::ValidationError, "Buffer is already mapped or has a map pending"));
        }
        data.map_pending = true;
        None
    }
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Object creation outside the wire ────────────────────

    pub fn create_instance(&self) -> NativeHandle {
        self.state.borrow_mut().create(ObjectType::Instance, None, NullKind::Plain)
    }

    pub fn create_device(&self) -> NativeHandle {
        self.state
            .borrow_mut()
            .create(ObjectType::Device, None, NullKind::Device(NullDevice::default()))
    }

    pub fn create_texture(&self, device: NativeHandle) -> NativeHandle {
        self.state
            .borrow_mut()
            .create(ObjectType::Texture, Some(device), NullKind::Plain)
    }

    pub fn create_swap_chain(&self, device: NativeHandle) -> NativeHandle {
        self.state
            .borrow_mut()
            .create(ObjectType::SwapChain, Some(device), NullKind::Plain)
    }

    pub fn create_buffer(&self, device: NativeHandle, size: u64, usage: BufferUsage) -> NativeHandle {
        let buffer = NullBuffer {
            data: vec![0; size as usize],
            usage,
            mapped: None,
            map_pending: false,
            destroyed: false,
        };
        self.state
            .borrow_mut()
            .create(ObjectType::Buffer, Some(device), NullKind::Buffer(buffer))
    }

    // ── Inspection ──────────────────────────────────────────

    /// Outstanding references to `native`; zero once it is gone.
    pub fn refcount(&self, native: NativeHandle) -> u32 {
        self.state
            .borrow()
            .objects
            .get(&native)
            .map_or(0, |object| object.refcount)
    }

    pub fn is_alive(&self, native: NativeHandle) -> bool {
        self.state.borrow().objects.contains_key(&native)
    }

    pub fn live_objects(&self, object_type: ObjectType) -> usize {
        self.state
            .borrow()
            .objects
            .values()
            .filter(|object| object.object_type == object_type)
            .count()
    }

    /// Every object freed so far, in order.
    pub fn released(&self) -> Vec<(ObjectType, NativeHandle)> {
        self.state.borrow().released.clone()
    }

    pub fn buffer_contents(&self, buffer: NativeHandle) -> Option<Vec<u8>> {
        self.state.borrow_mut().buffer(buffer).map(|b| b.data.clone())
    }

    pub fn set_buffer_contents(&self, buffer: NativeHandle, offset: usize, bytes: &[u8]) {
        if let Some(data) = self.state.borrow_mut().buffer(buffer) {
            if let Some(target) = data.data.get_mut(offset..offset + bytes.len()) {
                target.copy_from_slice(bytes);
            }
        }
    }

    pub fn is_mapped(&self, buffer: NativeHandle) -> bool {
        self.state
            .borrow_mut()
            .buffer(buffer)
            .is_some_and(|b| b.mapped.is_some())
    }

    pub fn device_callbacks_installed(&self, device: NativeHandle) -> bool {
        self.state.borrow_mut().device(device).is_some_and(|d| {
            d.error_callback.is_some() || d.logging_callback.is_some() || d.lost_callback.is_some()
        })
    }

    pub fn pending_work(&self) -> usize {
        self.state.borrow().work.len()
    }

    // ── Steering ────────────────────────────────────────────

    pub fn set_adapters_available(&self, available: bool) {
        self.state.borrow_mut().adapters_unavailable = !available;
    }

    pub fn fail_next_map(&self, status: MapAsyncStatus) {
        self.state.borrow_mut().fail_next_map = Some(status);
    }

    pub fn fail_next_pipeline(&self) {
        self.state.borrow_mut().fail_next_pipeline = true;
    }

    /// Lose `device` as if the GPU went away.
    pub fn lose_device(&self, device: NativeHandle, reason: DeviceLostReason, message: &str) {
        let callback = {
            let mut state = self.state.borrow_mut();
            let Some(data) = state.device(device) else {
                return;
            };
            if data.lost {
                return;
            }
            data.lost = true;
            data.error_callback = None;
            data.logging_callback = None;
            data.lost_callback.take()
        };
        debug!(%device, ?reason, "null device lost");
        if let Some(callback) = callback {
            callback(reason, message);
        }
    }

    pub fn emit_log(&self, device: NativeHandle, logging_type: LoggingType, message: &str) {
        let callback = self.state.borrow_mut().device(device).and_then(|d| d.logging_callback.take());
        if let Some(mut callback) = callback {
            callback(logging_type, message);
            if let Some(data) = self.state.borrow_mut().device(device) {
                data.logging_callback.get_or_insert(callback);
            }
        }
    }

    /// Number of error scopes pushed on `device` and not yet popped.
    pub fn error_scope_depth(&self, device: NativeHandle) -> usize {
        self.state
            .borrow_mut()
            .device(device)
            .map_or(0, |d| d.error_scopes.len())
    }

    fn emit_error(&self, device: NativeHandle, error_type: ErrorType, message: &str) {
        let callback = {
            let mut state = self.state.borrow_mut();
            let Some(data) = state.device(device) else {
                return;
            };
            if let Some(scope) = data
                .error_scopes
                .iter_mut()
                .rev()
                .find(|scope| scope.filter.matches(error_type))
            {
                scope.error.get_or_insert_with(|| (error_type, message.to_owned()));
                trace!(%device, ?error_type, "error captured by scope");
                return;
            }
            data.error_callback.take()
        };
        if let Some(mut callback) = callback {
            callback(error_type, message);
            if let Some(data) = self.state.borrow_mut().device(device) {
                data.error_callback.get_or_insert(callback);
            }
        }
    }

    fn create_child(&self, device: NativeHandle, object_type: ObjectType, kind: NullKind) -> Option<NativeHandle> {
        let mut state = self.state.borrow_mut();
        if state.is_lost(Some(device)) {
            return None;
        }
        Some(state.create(object_type, Some(device), kind))
    }
}

impl Backend for NullBackend {
    fn add_ref(&mut self, _object_type: ObjectType, native: NativeHandle) {
        if let Some(object) = self.state.borrow_mut().objects.get_mut(&native) {
            object.refcount += 1;
        }
    }

    fn release(&mut self, object_type: ObjectType, native: NativeHandle) {
        let mut state = self.state.borrow_mut();
        let Some(object) = state.objects.get_mut(&native) else {
            return;
        };
        object.refcount = object.refcount.saturating_sub(1);
        if object.refcount > 0 {
            return;
        }
        let Some(object) = state.objects.remove(&native) else {
            return;
        };
        state.released.push((object_type, native));
        trace!(%object_type, %native, "null object freed");
        match object.kind {
            NullKind::Device(device) => {
                if let Some(queue) = device.queue {
                    drop(state);
                    self.release(ObjectType::Queue, queue);
                }
            }
            NullKind::Buffer(_) => {
                state.cancel_maps(native, MapAsyncStatus::DestroyedBeforeCallback, "Buffer was released");
            }
            NullKind::Plain => {}
        }
    }

    fn instance_request_adapter(
        &mut self,
        _instance: NativeHandle,
        _options: &RequestAdapterOptions,
        callback: NativeRequestAdapterCallback,
    ) {
        self.state.borrow_mut().work.push_back(Work::Adapter { callback });
    }

    fn adapter_info(&mut self, _adapter: NativeHandle) -> AdapterInfo {
        AdapterInfo {
            vendor: "gpuwire".into(),
            architecture: "null".into(),
            device: "Null Device".into(),
            description: "In-memory null adapter".into(),
            backend_type: BackendType::Null,
            adapter_type: AdapterType::Cpu,
            vendor_id: 0,
            device_id: 0,
        }
    }

    fn adapter_request_device(
        &mut self,
        _adapter: NativeHandle,
        descriptor: &DeviceDescriptor,
        callback: NativeRequestDeviceCallback,
    ) {
        self.state.borrow_mut().work.push_back(Work::Device {
            required_limits: descriptor.required_limits,
            callback,
        });
    }

    fn device_limits(&mut self, _device: NativeHandle) -> Limits {
        Limits::default()
    }

    fn device_create_buffer(&mut self, device: NativeHandle, descriptor: &BufferDescriptor) -> Option<NativeHandle> {
        let usage = descriptor.usage();
        let invalid = descriptor.size > Limits::default().max_buffer_size
            || usage.contains(BufferUsage::MAP_READ | BufferUsage::MAP_WRITE)
            || (descriptor.mapped_at_creation && descriptor.size % MAP_SIZE_ALIGNMENT != 0);
        if invalid {
            let message = format!("invalid buffer descriptor: size {} usage {:?}", descriptor.size, usage);
            self.emit_error(device, ErrorType::Validation, &message);
            return None;
        }
        let buffer = NullBuffer {
            data: vec![0; descriptor.size as usize],
            usage,
            mapped: descriptor.mapped_at_creation.then_some((0, descriptor.size)),
            map_pending: false,
            destroyed: false,
        };
        self.create_child(device, ObjectType::Buffer, NullKind::Buffer(buffer))
    }

    fn device_create_texture(&mut self, device: NativeHandle, descriptor: &TextureDescriptor) -> Option<NativeHandle> {
        let size = descriptor.size;
        if size.width == 0 || size.height == 0 || size.depth_or_array_layers == 0 {
            self.emit_error(device, ErrorType::Validation, "texture extent must not be empty");
            return None;
        }
        self.create_child(device, ObjectType::Texture, NullKind::Plain)
    }

    fn device_create_shader_module(
        &mut self,
        device: NativeHandle,
        descriptor: &ShaderModuleDescriptor,
    ) -> Option<NativeHandle> {
        if descriptor.code.trim().is_empty() {
            self.emit_error(device, ErrorType::Validation, "shader module has no code");
            return None;
        }
        self.create_child(device, ObjectType::ShaderModule, NullKind::Plain)
    }

    fn device_create_compute_pipeline_async(
        &mut self,
        device: NativeHandle,
        _module: NativeHandle,
        entry_point: &str,
        callback: NativeCreatePipelineCallback,
    ) {
        let mut state = self.state.borrow_mut();
        let fail = if std::mem::take(&mut state.fail_next_pipeline) {
            Some("Pipeline failure requested".to_owned())
        } else if entry_point.is_empty() {
            Some("entry point must not be empty".to_owned())
        } else {
            None
        };
        state.work.push_back(Work::Pipeline { device, fail, callback });
    }

    fn device_get_queue(&mut self, device: NativeHandle) -> NativeHandle {
        let mut state = self.state.borrow_mut();
        let existing = state.device(device).and_then(|d| d.queue);
        let queue = match existing {
            Some(queue) => queue,
            None => {
                let queue = state.create(ObjectType::Queue, Some(device), NullKind::Plain);
                if let Some(data) = state.device(device) {
                    data.queue = Some(queue);
                }
                queue
            }
        };
        if let Some(object) = state.objects.get_mut(&queue) {
            object.refcount += 1;
        }
        queue
    }

    fn device_destroy(&mut self, device: NativeHandle) {
        self.lose_device(device, DeviceLostReason::Destroyed, DEVICE_DESTROYED_MESSAGE);
    }

    fn device_inject_error(&mut self, device: NativeHandle, error_type: ErrorType, message: &str) {
        if !self.state.borrow().is_lost(Some(device)) {
            self.emit_error(device, error_type, message);
        }
    }

    fn device_push_error_scope(&mut self, device: NativeHandle, filter: ErrorFilter) {
        if let Some(data) = self.state.borrow_mut().device(device) {
            data.error_scopes.push(ErrorScope { filter, error: None });
        }
    }

    fn device_pop_error_scope(&mut self, device: NativeHandle, callback: NativePopErrorScopeCallback) {
        let mut state = self.state.borrow_mut();
        let scope = state.device(device).and_then(|d| d.error_scopes.pop());
        state.work.push_back(Work::PopErrorScope { device, scope, callback });
    }

    fn device_set_uncaptured_error_callback(&mut self, device: NativeHandle, callback: Option<NativeErrorCallback>) {
        if let Some(data) = self.state.borrow_mut().device(device) {
            data.error_callback = callback;
        }
    }

    fn device_set_logging_callback(&mut self, device: NativeHandle, callback: Option<NativeLoggingCallback>) {
        if let Some(data) = self.state.borrow_mut().device(device) {
            data.logging_callback = callback;
        }
    }

    fn device_set_device_lost_callback(&mut self, device: NativeHandle, callback: Option<NativeDeviceLostCallback>) {
        if let Some(data) = self.state.borrow_mut().device(device) {
            data.lost_callback = callback;
        }
    }

    fn buffer_map_async(
        &mut self,
        buffer: NativeHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: NativeMapCallback,
    ) {
        let mut state = self.state.borrow_mut();
        let outcome = state.validate_map(buffer, mode, offset, size);
        state.work.push_back(Work::Map { buffer, offset, size, outcome, callback });
    }

    fn buffer_with_mapped_range(
        &mut self,
        buffer: NativeHandle,
        offset: u64,
        size: u64,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(data) = state.buffer(buffer) else {
            return false;
        };
        let Some((mapped_offset, mapped_size)) = data.mapped else {
            return false;
        };
        let Some(end) = offset.checked_add(size) else {
            return false;
        };
        if offset < mapped_offset || end > mapped_offset + mapped_size {
            return false;
        }
        match data.data.get_mut(offset as usize..end as usize) {
            Some(range) => {
                f(range);
                true
            }
            None => false,
        }
    }

    fn buffer_unmap(&mut self, buffer: NativeHandle) {
        let mut state = self.state.borrow_mut();
        if let Some(data) = state.buffer(buffer) {
            data.mapped = None;
        }
        state.cancel_maps(buffer, MapAsyncStatus::UnmappedBeforeCallback, "Buffer was unmapped before the map resolved");
    }

    fn buffer_destroy(&mut self, buffer: NativeHandle) {
        let mut state = self.state.borrow_mut();
        if let Some(data) = state.buffer(buffer) {
            data.mapped = None;
            data.destroyed = true;
        }
        state.cancel_maps(buffer, MapAsyncStatus::DestroyedBeforeCallback, "Buffer was destroyed before the map resolved");
    }

    fn queue_write_buffer(&mut self, queue: NativeHandle, buffer: NativeHandle, buffer_offset: u64, data: &[u8]) {
        let error = {
            let mut state = self.state.borrow_mut();
            match state.buffer(buffer) {
                Some(target) if target.destroyed => Some("cannot write to a destroyed buffer"),
                Some(target) if target.mapped.is_some() => Some("cannot write to a mapped buffer"),
                Some(target) => {
                    let range = usize::try_from(buffer_offset)
                        .ok()
                        .and_then(|start| target.data.get_mut(start..start.checked_add(data.len())?));
                    match range {
                        Some(range) => {
                            range.copy_from_slice(data);
                            None
                        }
                        None => Some("write exceeds the buffer"),
                    }
                }
                None => Some("buffer is not live"),
            }
        };
        if let Some(message) = error {
            let device = self.state.borrow().device_of(queue);
            if let Some(device) = device {
                self.emit_error(device, ErrorType::Validation, message);
            }
        }
    }

    fn queue_on_submitted_work_done(&mut self, queue: NativeHandle, callback: NativeWorkDoneCallback) {
        self.state.borrow_mut().work.push_back(Work::WorkDone { queue, callback });
    }

    fn tick(&mut self) {
        let work: Vec<Work> = self.state.borrow_mut().work.drain(..).collect();
        for item in work {
            match item {
                Work::Adapter { callback } => {
                    let result = {
                        let mut state = self.state.borrow_mut();
                        if state.adapters_unavailable {
                            None
                        } else {
                            Some(state.create(ObjectType::Adapter, None, NullKind::Plain))
                        }
                    };
                    match result {
                        Some(adapter) => callback(RequestAdapterStatus::Success, Some(adapter), ""),
                        None => callback(RequestAdapterStatus::Unavailable, None, "No adapter is available"),
                    }
                }
                Work::Device { required_limits, callback } => {
                    let supported = Limits::default();
                    let exceeds = required_limits.is_some_and(|limits| {
                        limits.max_buffer_size > supported.max_buffer_size
                            || limits.max_bind_groups > supported.max_bind_groups
                            || limits.max_texture_dimension_2d > supported.max_texture_dimension_2d
                    });
                    if exceeds {
                        callback(RequestDeviceStatus::Error, None, "Required limits exceed the adapter");
                        continue;
                    }
                    let device = self
                        .state
                        .borrow_mut()
                        .create(ObjectType::Device, None, NullKind::Device(NullDevice::default()));
                    callback(RequestDeviceStatus::Success, Some(device), "");
                }
                Work::Pipeline { device, fail, callback } => {
                    let result = {
                        let mut state = self.state.borrow_mut();
                        if state.is_lost(Some(device)) {
                            Err((CreatePipelineAsyncStatus::DeviceLost, "Device is lost".to_owned()))
                        } else if let Some(message) = fail {
                            Err((CreatePipelineAsyncStatus::ValidationError, message))
                        } else {
                            Ok(state.create(ObjectType::ComputePipeline, Some(device), NullKind::Plain))
                        }
                    };
                    match result {
                        Ok(pipeline) => callback(CreatePipelineAsyncStatus::Success, Some(pipeline), ""),
                        Err((status, message)) => callback(status, None, &message),
                    }
                }
                Work::Map { buffer, offset, size, outcome, callback } => {
                    let outcome = {
                        let mut state = self.state.borrow_mut();
                        let lost = state.is_lost(state.device_of(buffer));
                        match (outcome, state.buffer(buffer)) {
                            (Some(outcome), _) => Err(outcome),
                            (None, None) => Err((MapAsyncStatus::DestroyedBeforeCallback, "Buffer was released")),
                            (None, Some(data)) => {
                                data.map_pending = false;
                                if lost {
                                    Err((MapAsyncStatus::DeviceLost, "Device is lost"))
                                } else {
                                    data.mapped = Some((offset, size));
                                    Ok(())
                                }
                            }
                        }
                    };
                    match outcome {
                        Ok(()) => callback(MapAsyncStatus::Success, ""),
                        Err((status, message)) => callback(status, message),
                    }
                }
                Work::WorkDone { queue, callback } => {
                    let lost = {
                        let state = self.state.borrow();
                        state.is_lost(state.device_of(queue))
                    };
                    let status = if lost { QueueWorkDoneStatus::DeviceLost } else { QueueWorkDoneStatus::Success };
                    callback(status);
                }
                Work::PopErrorScope { device, scope, callback } => {
                    let lost = self.state.borrow().is_lost(Some(device));
                    match scope {
                        _ if lost => callback(PopErrorScopeStatus::DeviceLost, ErrorType::DeviceLost, "Device is lost"),
                        None => callback(PopErrorScopeStatus::EmptyStack, ErrorType::Unknown, "No error scopes to pop"),
                        Some(ErrorScope { error: Some((error_type, message)), .. }) => {
                            callback(PopErrorScopeStatus::Success, error_type, &message)
                        }
                        Some(ErrorScope { error: None, .. }) => {
                            callback(PopErrorScopeStatus::Success, ErrorType::NoError, "")
                        }
                    }
                }
            }
        }
    }
}
