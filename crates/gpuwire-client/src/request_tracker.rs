use std::collections::BTreeMap;

use gpuwire_protocol::RequestSerial;

/// Pending asynchronous requests of one object, keyed by serial.
///
/// A request leaves the tracker exactly once: through `take` when its
/// response arrives, or through `drain` when the owner is torn down. Either
/// way the caller is then responsible for firing its callback.
pub(crate) struct RequestTracker<R> {
    requests: BTreeMap<RequestSerial, R>,
}

impl<R> Default for RequestTracker<R> {
    fn default() -> Self {
        Self {
            requests: BTreeMap::new(),
        }
    }
}

impl<R> RequestTracker<R> {
    pub(crate) fn add(&mut self, serial: RequestSerial, request: R) {
        self.requests.insert(serial, request);
    }

    pub(crate) fn take(&mut self, serial: RequestSerial) -> Option<R> {
        self.requests.remove(&serial)
    }

    /// Remove every request in serial order.
    pub(crate) fn drain(&mut self) -> Vec<(RequestSerial, R)> {
        std::mem::take(&mut self.requests).into_iter().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_is_serial_ordered() {
        let mut tracker = RequestTracker::default();
        tracker.add(7, "c");
        tracker.add(2, "a");
        tracker.add(5, "b");
        assert_eq!(tracker.len(), 3);

        assert_eq!(tracker.take(5), Some("b"));
        assert_eq!(tracker.take(5), None);

        let drained = tracker.drain();
        assert_eq!(drained, vec![(2, "a"), (7, "c")]);
        assert!(tracker.is_empty());
    }
}
