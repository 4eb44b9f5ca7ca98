use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::serializer::{CommandHandler, CommandSerializer};

/// Create an in-process transport. Each flush (or a batch filling up)
/// sends one chunk of at most `max_allocation_size` bytes to the receiver.
pub fn channel(max_allocation_size: usize) -> (LoopbackSerializer, LoopbackReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        LoopbackSerializer {
            tx,
            batch: Vec::with_capacity(max_allocation_size),
            max_allocation_size: max_allocation_size.max(1),
            closed: false,
        },
        LoopbackReceiver {
            rx,
            pending: Vec::new(),
            disconnected: false,
        },
    )
}

/// Sending half of the loopback transport.
pub struct LoopbackSerializer {
    tx: Sender<Vec<u8>>,
    batch: Vec<u8>,
    max_allocation_size: usize,
    /// Set once the receiver is gone.
    closed: bool,
}

impl LoopbackSerializer {
    fn send_batch(&mut self) -> bool {
        if self.batch.is_empty() {
            return !self.closed;
        }
        let chunk = std::mem::replace(&mut self.batch, Vec::with_capacity(self.max_allocation_size));
        let len = chunk.len();
        if self.tx.send(chunk).is_err() {
            debug!("loopback receiver dropped, {} bytes lost", len);
            self.closed = true;
            return false;
        }
        trace!(bytes = len, "loopback chunk sent");
        true
    }

    /// Bytes reserved but not flushed yet.
    pub fn pending_len(&self) -> usize {
        self.batch.len()
    }
}

impl CommandSerializer for LoopbackSerializer {
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        if self.closed || size > self.max_allocation_size {
            return None;
        }
        if self.batch.len() + size > self.max_allocation_size && !self.send_batch() {
            return None;
        }
        let start = self.batch.len();
        self.batch.resize(start + size, 0);
        Some(&mut self.batch[start..])
    }

    fn flush(&mut self) -> bool {
        self.send_batch()
    }

    fn maximum_allocation_size(&self) -> usize {
        self.max_allocation_size
    }
}

/// Receiving half of the loopback transport. Keeps the unconsumed tail of
/// the stream between deliveries.
pub struct LoopbackReceiver {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    disconnected: bool,
}

impl LoopbackReceiver {
    /// Move every chunk sent so far into the pending buffer.
    /// Returns the number of new bytes.
    pub fn poll(&mut self) -> usize {
        let mut received = 0;
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    received += chunk.len();
                    self.pending.extend_from_slice(&chunk);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        received
    }

    /// Block until at least one chunk arrives.
    pub fn wait(&mut self) -> Result<usize, TransportError> {
        let chunk = self.rx.recv().map_err(|_| {
            self.disconnected = true;
            TransportError::ConnectionClosed
        })?;
        let received = chunk.len();
        self.pending.extend_from_slice(&chunk);
        Ok(received + self.poll())
    }

    /// Feed everything received so far to `handler`, keeping any partial
    /// command for the next delivery. Returns the number of bytes consumed.
    pub fn deliver<H: CommandHandler>(&mut self, handler: &mut H) -> Result<usize, H::Error> {
        self.poll();
        if self.pending.is_empty() {
            return Ok(0);
        }
        let remaining = handler.handle_commands(&self.pending)?.len();
        let consumed = self.pending.len() - remaining;
        self.pending.drain(..consumed);
        Ok(consumed)
    }

    /// Take the raw bytes received so far without handling them.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        self.poll();
        std::mem::take(&mut self.pending)
    }

    /// Bytes received but not consumed yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the sending half has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}
