use gpuwire_protocol::types::QueueWorkDoneStatus;
use gpuwire_protocol::{Command, ObjectHandle, RequestSerial};
use tracing::debug;

use crate::client::{Client, DeferredCallbacks};
use crate::error::ClientError;
use crate::memory_transfer::MemoryTransferService;
use crate::objects::{Buffer, Device, Queue, WireObject};
use crate::request_tracker::RequestTracker;

pub type QueueWorkDoneCallback<M> = Box<dyn FnOnce(&mut Client<M>, QueueWorkDoneStatus)>;

pub(crate) struct QueueState<M: MemoryTransferService> {
    pub(crate) refcount: u32,
    device: ObjectHandle,
    work_done_requests: RequestTracker<QueueWorkDoneCallback<M>>,
}

impl<M: MemoryTransferService> QueueState<M> {
    pub(crate) fn new(device: ObjectHandle) -> Self {
        Self {
            // One reference held by the device, one for the caller.
            refcount: 2,
            device,
            work_done_requests: RequestTracker::default(),
        }
    }

    pub(crate) fn cancel_requests(&mut self, status: QueueWorkDoneStatus, deferred: &mut DeferredCallbacks<M>) {
        for (serial, callback) in self.work_done_requests.drain() {
            deferred.push(serial, move |client| callback(client, status));
        }
    }
}

impl<M: MemoryTransferService> Client<M> {
    /// Write `data` into `buffer` at `buffer_offset` once previously
    /// submitted work has run.
    pub fn queue_write_buffer(
        &mut self,
        queue: Queue,
        buffer: Buffer,
        buffer_offset: u64,
        data: &[u8],
    ) -> Result<(), ClientError> {
        self.queues.get(queue.handle())?;
        self.buffers.get(buffer.handle())?;
        self.serialize(&Command::QueueWriteBuffer {
            queue: queue.handle(),
            buffer: buffer.handle(),
            buffer_offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    pub fn queue_on_submitted_work_done(
        &mut self,
        queue: Queue,
        callback: impl FnOnce(&mut Client<M>, QueueWorkDoneStatus) + 'static,
    ) {
        if self.is_disconnected() {
            return callback(self, QueueWorkDoneStatus::DeviceLost);
        }
        let request_serial = self.next_serial();
        match self.queues.get_mut(queue.handle()) {
            Ok(state) => state.work_done_requests.add(request_serial, Box::new(callback)),
            Err(e) => {
                debug!(error = %e, "work done requested on an unknown queue");
                return callback(self, QueueWorkDoneStatus::Unknown);
            }
        }
        self.serialize(&Command::QueueOnSubmittedWorkDone {
            queue: queue.handle(),
            request_serial,
        });
    }

    pub fn queue_device(&self, queue: Queue) -> Result<Device, ClientError> {
        Ok(Device::from_handle(self.queues.get(queue.handle())?.device))
    }

    pub(crate) fn on_queue_work_done(&mut self, queue: ObjectHandle, request_serial: RequestSerial, status: QueueWorkDoneStatus) {
        let callback = self
            .queues
            .get_mut(queue)
            .ok()
            .and_then(|state| state.work_done_requests.take(request_serial));
        match callback {
            Some(callback) => callback(self, status),
            None => debug!(%queue, request_serial, "stale work done response ignored"),
        }
    }

    pub(crate) fn teardown_queue(&mut self, handle: ObjectHandle, deferred: &mut DeferredCallbacks<M>) {
        if let Ok(mut state) = self.queues.free(handle) {
            state.cancel_requests(QueueWorkDoneStatus::Unknown, deferred);
        }
    }
}
