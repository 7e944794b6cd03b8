use crate::data::Data;
use crate::event::{ErrorKind, Event};

/// A FIFO of deferred events, replayed later in arrival order. Used by mux
/// streams and demux receivers that cannot forward yet.
#[derive(Default)]
pub struct EventBuffer {
    events: Vec<Event>,
}

impl EventBuffer {
    pub fn new() -> EventBuffer {
        EventBuffer { events: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn push(&mut self, evt: Event) {
        self.events.push(evt);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Replays all buffered events into `out`, leaving the buffer empty.
    pub fn flush(&mut self, out: &mut dyn FnMut(Event)) {
        for evt in self.events.drain(..) {
            out(evt);
        }
    }
}

/// A byte accumulator with an optional cap. Exceeding the cap records an
/// overflow which the owner surfaces as `StreamEnd(BufferOverflow)`.
pub struct DataBuffer {
    data: Data,
    limit: usize,
    overflow: bool,
}

impl DataBuffer {
    /// `limit` of zero means unbounded.
    pub fn new(limit: usize) -> DataBuffer {
        DataBuffer {
            data: Data::new(),
            limit,
            overflow: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflow
    }

    pub fn push(&mut self, data: Data) {
        if self.limit > 0 && self.data.len() + data.len() > self.limit {
            self.overflow = true;
            return;
        }
        self.data.push(data);
    }

    /// Takes the accumulated bytes, leaving the buffer empty.
    pub fn take(&mut self) -> Data {
        std::mem::replace(&mut self.data, Data::new())
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.overflow = false;
    }

    /// The event to emit when an overflow was recorded.
    pub fn overflow_event() -> Event {
        Event::stream_end(Some(ErrorKind::BufferOverflow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_buffer_replays_in_order() {
        let mut buf = EventBuffer::new();
        buf.push(Event::message_start(None));
        buf.push(Event::Data(Data::from_slice(b"x")));
        buf.push(Event::message_end(None));

        let mut kinds = Vec::new();
        buf.flush(&mut |evt| {
            kinds.push(match evt {
                Event::MessageStart(_) => 0,
                Event::Data(_) => 1,
                Event::MessageEnd(_) => 2,
                Event::StreamEnd(_) => 3,
            })
        });
        assert_eq!(kinds, vec![0, 1, 2]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_data_buffer_limit() {
        let mut buf = DataBuffer::new(4);
        buf.push(Data::from_slice(b"abc"));
        assert!(!buf.has_overflowed());

        buf.push(Data::from_slice(b"de"));
        assert!(buf.has_overflowed());
        // The overflowing push is dropped, prior content stays intact.
        assert_eq!(buf.take().to_vec(), b"abc");
    }

    #[test]
    fn test_data_buffer_unbounded() {
        let mut buf = DataBuffer::new(0);
        buf.push(Data::from_slice(&[0u8; 10000]));
        assert!(!buf.has_overflowed());
        assert_eq!(buf.len(), 10000);
    }
}
