use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use slog::{o, Logger};

use crate::buffer::EventBuffer;
use crate::config::MuxOptions;
use crate::event::{ErrorKind, Event};
use crate::pipeline::{Pipeline, PipelineLayout};

/// Client-side multiplexer: packs many logical request streams onto one
/// persistent transport session per key.
///
/// A session's pipeline represents the whole round trip: request events are
/// fed into it in stream order, and the events it emits are the responses,
/// demultiplexed back to the pending streams first-in-first-out.
pub struct Muxer {
    options: MuxOptions,
    sessions: HashMap<String, Rc<RefCell<Session>>>,
    log: Logger,
}

impl Muxer {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(options: MuxOptions, log: L) -> Muxer {
        let log = match log.into() {
            Some(log) => log.new(o!()),
            None => crate::logging::discard(),
        };
        Muxer {
            options,
            sessions: HashMap::new(),
            log,
        }
    }

    /// Opens a logical stream on the session selected by `key`, creating the
    /// session (and its transport pipeline from `layout`) on first use.
    /// Fails with `BufferOverflow` when the session's queue is full.
    pub fn open_stream(
        &mut self,
        key: &str,
        layout: &Rc<PipelineLayout>,
    ) -> Result<StreamHandle, ErrorKind> {
        let session = self.alloc(key, layout);
        let id = {
            let mut s = session.borrow_mut();
            if self.options.max_queue > 0 && s.streams.len() >= self.options.max_queue {
                return Err(ErrorKind::BufferOverflow);
            }
            s.open_stream()
        };
        Ok(StreamHandle { session, id })
    }

    fn alloc(&mut self, key: &str, layout: &Rc<PipelineLayout>) -> Rc<RefCell<Session>> {
        if let Some(session) = self.sessions.get(key) {
            let reusable = {
                let s = session.borrow();
                !s.ended && !s.exhausted(self.options.max_messages_per_session)
            };
            if reusable {
                session.borrow_mut().free_at = None;
                return session.clone();
            }
            self.sessions.remove(key);
        }
        slog::debug!(self.log, "opening mux session"; "context" => "alloc", "key" => key);
        let session = Rc::new(RefCell::new(Session::new(Pipeline::new(
            layout.clone(),
            &self.log,
        ))));
        self.sessions.insert(key.to_string(), session.clone());
        session
    }

    /// Retires sessions that have sat free longer than `max_idle`. Driven by
    /// the worker's ticker.
    pub fn sweep(&mut self, now: Instant) {
        let max_idle = Duration::from_secs_f64(self.options.max_idle);
        self.sessions.retain(|_, session| {
            let s = session.borrow();
            match s.free_at {
                Some(at) => now.duration_since(at) < max_idle,
                None => true,
            }
        });
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The session currently registered under `key`, if any. Lets callers
    /// check connection reuse.
    pub fn session(&self, key: &str) -> Option<Rc<RefCell<Session>>> {
        self.sessions.get(key).cloned()
    }
}

/// One logical request/response pair within a session.
pub struct StreamHandle {
    session: Rc<RefCell<Session>>,
    id: u64,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Rc<RefCell<Session>> {
        &self.session
    }

    /// Feeds a request event. Events arriving before this stream's sending
    /// turn are buffered locally.
    pub fn input(&self, evt: Event) {
        self.session.borrow_mut().stream_input(self.id, evt);
    }

    /// Drains buffered response events for this stream.
    pub fn drain(&self, out: &mut dyn FnMut(Event)) {
        self.session.borrow_mut().stream_drain(self.id, out);
    }

    /// Detaches the stream. The underlying state is recycled only once both
    /// its input and output sides are done.
    pub fn close(self) {
        self.session.borrow_mut().close_stream(self.id);
    }
}

struct StreamState {
    id: u64,
    /// All request events received from the caller (possibly still buffered).
    input_done: bool,
    /// Request fully forwarded onto the shared transport.
    sent_done: bool,
    output_end: bool,
    detached: bool,
    pending_input: EventBuffer,
    output: EventBuffer,
    response_started: bool,
}

impl StreamState {
    fn done(&self) -> bool {
        self.sent_done && self.output_end
    }
}

/// A shared transport and the FIFO of streams riding on it.
pub struct Session {
    pipeline: Pipeline,
    streams: VecDeque<StreamState>,
    next_id: u64,
    message_count: usize,
    free_at: Option<Instant>,
    ended: bool,
}

impl Session {
    fn new(pipeline: Pipeline) -> Session {
        Session {
            pipeline,
            streams: VecDeque::new(),
            next_id: 0,
            message_count: 0,
            free_at: None,
            ended: false,
        }
    }

    fn exhausted(&self, max_messages: usize) -> bool {
        max_messages > 0 && self.message_count >= max_messages
    }

    fn open_stream(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.message_count += 1;
        self.streams.push_back(StreamState {
            id,
            input_done: false,
            sent_done: false,
            output_end: false,
            detached: false,
            pending_input: EventBuffer::new(),
            output: EventBuffer::new(),
            response_started: false,
        });
        id
    }

    fn close_stream(&mut self, id: u64) {
        if let Some(s) = self.streams.iter_mut().find(|s| s.id == id) {
            s.detached = true;
        }
        self.recycle();
    }

    /// True when this stream may write to the shared transport: every
    /// earlier stream has finished sending.
    fn is_sending_turn(&self, id: u64) -> bool {
        for s in &self.streams {
            if s.id == id {
                return true;
            }
            if !s.sent_done {
                return false;
            }
        }
        false
    }

    fn stream_input(&mut self, id: u64, evt: Event) {
        if self.ended {
            return;
        }
        if !self.is_sending_turn(id) {
            if let Some(s) = self.streams.iter_mut().find(|s| s.id == id) {
                if !s.input_done {
                    if evt.is_end() {
                        s.pending_input.push(Event::message_end(None));
                        s.input_done = true;
                    } else {
                        s.pending_input.push(evt);
                    }
                }
            }
            return;
        }
        self.forward(id, evt);
        self.pump_pending();
    }

    fn forward(&mut self, id: u64, evt: Event) {
        let ends_input = evt.is_end();
        let mut replies = Vec::new();
        self.pipeline.input(evt, &mut |e| replies.push(e));
        if ends_input {
            if let Some(s) = self.streams.iter_mut().find(|s| s.id == id) {
                s.input_done = true;
                s.sent_done = true;
            }
        }
        for e in replies {
            self.on_reply(e);
        }
    }

    /// After a stream finishes sending, the next stream's buffered request
    /// flows out.
    fn pump_pending(&mut self) {
        loop {
            let next = self
                .streams
                .iter()
                .find(|s| !s.sent_done)
                .filter(|s| !s.pending_input.is_empty())
                .map(|s| s.id);
            let id = match next {
                Some(id) if self.is_sending_turn(id) => id,
                _ => return,
            };
            let mut events = Vec::new();
            if let Some(s) = self.streams.iter_mut().find(|s| s.id == id) {
                s.pending_input.flush(&mut |e| events.push(e));
            }
            for e in events {
                self.forward(id, e);
            }
            let still_sending = self
                .streams
                .iter()
                .find(|s| s.id == id)
                .map_or(false, |s| !s.sent_done);
            if still_sending {
                return;
            }
        }
    }

    /// Routes one response event to the head-of-queue stream still awaiting
    /// output.
    fn on_reply(&mut self, evt: Event) {
        if let Event::StreamEnd(ref eos) = evt {
            // Transport died: every pending stream sees the end.
            for s in self.streams.iter_mut() {
                if !s.output_end {
                    s.output.push(Event::StreamEnd(eos.clone()));
                    s.output_end = true;
                }
            }
            self.ended = true;
            self.recycle();
            return;
        }
        let head = match self.streams.iter_mut().find(|s| !s.output_end) {
            Some(s) => s,
            None => return,
        };
        match &evt {
            Event::MessageStart(_) => {
                if head.response_started {
                    return;
                }
                head.response_started = true;
                head.output.push(evt);
            }
            Event::Data(_) => {
                if head.response_started {
                    head.output.push(evt);
                }
            }
            Event::MessageEnd(_) => {
                if head.response_started {
                    head.response_started = false;
                    head.output.push(evt);
                    head.output_end = true;
                    self.recycle();
                }
            }
            Event::StreamEnd(_) => unreachable!("handled above"),
        }
    }

    fn stream_drain(&mut self, id: u64, out: &mut dyn FnMut(Event)) {
        if let Some(s) = self.streams.iter_mut().find(|s| s.id == id) {
            s.output.flush(out);
        }
        self.recycle();
    }

    /// Pops fully-done detached streams off the front and marks the session
    /// free when nothing is left.
    fn recycle(&mut self) {
        while let Some(front) = self.streams.front() {
            if front.done() && front.detached && front.output.is_empty() {
                self.streams.pop_front();
            } else {
                break;
            }
        }
        if self.streams.is_empty() && self.free_at.is_none() {
            self.free_at = Some(Instant::now());
        }
        if !self.streams.is_empty() {
            self.free_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::event::Event;
    use crate::pipeline::{Filter, FilterCtx};

    /// A loopback transport: answers every request message with one response
    /// message tagging the request body.
    struct Responder {
        body: String,
    }

    impl Filter for Responder {
        fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
            match evt {
                Event::MessageStart(_) => self.body.clear(),
                Event::Data(d) => self.body.push_str(&d.to_string_lossy()),
                Event::MessageEnd(_) => {
                    out(Event::message_start(None));
                    out(Event::Data(Data::from_str(&format!("re:{}", self.body))));
                    out(Event::message_end(None));
                }
                Event::StreamEnd(e) => out(Event::StreamEnd(e)),
            }
        }
    }

    fn transport() -> Rc<PipelineLayout> {
        PipelineLayout::new("loopback")
            .append(|| Responder {
                body: String::new(),
            })
            .shared()
    }

    fn send(stream: &StreamHandle, body: &str) {
        stream.input(Event::message_start(None));
        stream.input(Event::Data(Data::from_str(body)));
        stream.input(Event::message_end(None));
    }

    fn response(stream: &StreamHandle) -> Option<String> {
        let mut body = String::new();
        let mut ended = false;
        stream.drain(&mut |evt| match evt {
            Event::Data(d) => body.push_str(&d.to_string_lossy()),
            Event::MessageEnd(_) => ended = true,
            _ => {}
        });
        if ended {
            Some(body)
        } else {
            None
        }
    }

    #[test]
    fn test_session_reuse_same_key() {
        let layout = transport();
        let mut muxer = Muxer::new(MuxOptions::default(), None);

        let a = muxer.open_stream("upstream:80", &layout).unwrap();
        let b = muxer.open_stream("upstream:80", &layout).unwrap();

        // Both streams ride the same session; ids allocate in order.
        assert!(Rc::ptr_eq(a.session(), b.session()));
        assert_eq!(muxer.session_count(), 1);
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);

        send(&a, "one");
        send(&b, "two");
        assert_eq!(response(&a).as_deref(), Some("re:one"));
        assert_eq!(response(&b).as_deref(), Some("re:two"));
    }

    #[test]
    fn test_distinct_keys_get_distinct_sessions() {
        let layout = transport();
        let mut muxer = Muxer::new(MuxOptions::default(), None);

        let a = muxer.open_stream("x:80", &layout).unwrap();
        let b = muxer.open_stream("y:80", &layout).unwrap();
        assert!(!Rc::ptr_eq(a.session(), b.session()));
        assert_eq!(muxer.session_count(), 2);
    }

    #[test]
    fn test_second_stream_buffers_until_turn() {
        let layout = transport();
        let mut muxer = Muxer::new(MuxOptions::default(), None);

        let a = muxer.open_stream("k", &layout).unwrap();
        let b = muxer.open_stream("k", &layout).unwrap();

        // B sends first but must not reach the transport before A finishes.
        b.input(Event::message_start(None));
        b.input(Event::Data(Data::from_str("second")));
        b.input(Event::message_end(None));
        assert_eq!(response(&b), None);

        send(&a, "first");
        assert_eq!(response(&a).as_deref(), Some("re:first"));
        assert_eq!(response(&b).as_deref(), Some("re:second"));
    }

    #[test]
    fn test_max_queue_overflow() {
        let layout = transport();
        let mut options = MuxOptions::default();
        options.max_queue = 1;
        let mut muxer = Muxer::new(options, None);

        let a = muxer.open_stream("k", &layout).unwrap();
        let err = match muxer.open_stream("k", &layout) {
            Err(e) => e,
            Ok(_) => panic!("queue is full"),
        };
        assert_eq!(err, ErrorKind::BufferOverflow);
        drop(a);
    }

    #[test]
    fn test_idle_sweep_retires_session() {
        let layout = transport();
        let mut options = MuxOptions::default();
        options.max_idle = 0.0;
        let mut muxer = Muxer::new(options, None);

        let a = muxer.open_stream("k", &layout).unwrap();
        send(&a, "x");
        assert!(response(&a).is_some());
        a.close();

        muxer.sweep(Instant::now() + Duration::from_secs(1));
        assert_eq!(muxer.session_count(), 0);
    }

    #[test]
    fn test_transport_failure_fans_out() {
        struct Dead;
        impl Filter for Dead {
            fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
                if let Event::MessageEnd(_) = evt {
                    out(Event::stream_end(Some(ErrorKind::ConnectionReset)));
                }
            }
        }
        let layout = PipelineLayout::new("dead").append(|| Dead).shared();
        let mut muxer = Muxer::new(MuxOptions::default(), None);

        let a = muxer.open_stream("k", &layout).unwrap();
        let b = muxer.open_stream("k", &layout).unwrap();
        send(&a, "x");

        let mut errs = Vec::new();
        a.drain(&mut |evt| {
            if let Event::StreamEnd(e) = evt {
                errs.push(e.error);
            }
        });
        b.drain(&mut |evt| {
            if let Event::StreamEnd(e) = evt {
                errs.push(e.error);
            }
        });
        assert_eq!(
            errs,
            vec![
                Some(ErrorKind::ConnectionReset),
                Some(ErrorKind::ConnectionReset)
            ]
        );

        // The dead session is not handed out again.
        let c = muxer.open_stream("k", &layout).unwrap();
        assert!(!Rc::ptr_eq(a.session(), c.session()));
    }
}
