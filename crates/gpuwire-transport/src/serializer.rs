/// Outgoing half of a transport. Batches command bytes until flushed.
pub trait CommandSerializer {
    /// Reserve exactly `size` bytes at the end of the current batch.
    /// Returns `None` when the request exceeds
    /// [`maximum_allocation_size`](Self::maximum_allocation_size) or the
    /// transport can no longer accept bytes.
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]>;

    /// Hand every batched byte to the peer. `false` is a hard transport
    /// failure.
    fn flush(&mut self) -> bool;

    fn maximum_allocation_size(&self) -> usize;
}

impl<S: CommandSerializer + ?Sized> CommandSerializer for Box<S> {
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        (**self).get_cmd_space(size)
    }

    fn flush(&mut self) -> bool {
        (**self).flush()
    }

    fn maximum_allocation_size(&self) -> usize {
        (**self).maximum_allocation_size()
    }
}

/// Incoming half of a transport, implemented by the wire runtimes.
pub trait CommandHandler {
    type Error;

    /// Handle every complete command at the front of `commands` and return
    /// the unconsumed tail, which holds at most one partial command.
    fn handle_commands<'a>(&mut self, commands: &'a [u8]) -> Result<&'a [u8], Self::Error>;
}

/// Write one encoded frame, split across allocations when it is larger than
/// the transport's maximum allocation size.
pub fn write_frame(serializer: &mut dyn CommandSerializer, frame: &[u8]) -> bool {
    let max = serializer.maximum_allocation_size().max(1);
    for chunk in frame.chunks(max) {
        match serializer.get_cmd_space(chunk.len()) {
            Some(space) => space.copy_from_slice(chunk),
            None => return false,
        }
    }
    true
}
