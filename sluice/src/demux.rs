use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::DemuxOptions;
use crate::event::Event;
use crate::pipeline::{Filter, FilterCtx, Pipeline};

/// Server-side demultiplexer: accepts a sequence of inbound messages on one
/// transport, dispatches each to a freshly instantiated sub-pipeline (child
/// layout 0), and forwards the responses back onto the transport in strict
/// inbound order.
///
/// Responses produced out of turn are buffered on their receiver until every
/// earlier receiver has completed. A receiver completes after `output_count`
/// response messages (zero means fire-and-forget: no receiver is queued at
/// all, so later requests never stall behind it).
pub struct DemuxQueue {
    options: DemuxOptions,
    next_seq: u64,
    current: Option<u64>,
    oneway: Option<Pipeline>,
    receivers: VecDeque<Receiver>,
    input_buffer: VecDeque<Event>,
    waiting_output_requested: bool,
    waiting_output: bool,
    closed_tap: Option<Rc<crate::pipeline::Tap>>,
    dedicate_flag: Rc<Cell<bool>>,
    dedicated: Option<Receiver>,
    shutdown: bool,
    closed: bool,
    stream_end: Option<Event>,
    message_count: usize,
}

struct Receiver {
    seq: u64,
    pipeline: Option<Pipeline>,
    remaining: usize,
    started: bool,
    buffer: Vec<Event>,
    buffered_complete: usize,
}

impl Receiver {
    /// Forwards one live response event at the head of the queue. Returns
    /// true when this event completed a response message.
    fn forward(&mut self, evt: Event, out: &mut dyn FnMut(Event)) -> bool {
        match evt {
            Event::MessageStart(start) => {
                if !self.started {
                    self.started = true;
                    out(Event::MessageStart(start));
                }
                false
            }
            Event::Data(data) => {
                if self.started {
                    out(Event::Data(data));
                }
                false
            }
            Event::MessageEnd(end) => {
                if self.started {
                    self.started = false;
                    self.remaining = self.remaining.saturating_sub(1);
                    out(Event::MessageEnd(end));
                    return true;
                }
                false
            }
            Event::StreamEnd(_) => {
                // A sub-pipeline ending mid-message still owes the transport
                // a well-formed close.
                if self.started {
                    self.started = false;
                    self.remaining = self.remaining.saturating_sub(1);
                    out(Event::message_end(None));
                    return true;
                }
                false
            }
        }
    }

    /// Buffers an out-of-turn response event, dropping anything beyond the
    /// expected number of messages.
    fn stash(&mut self, evt: Event) {
        if self.buffered_complete >= self.remaining {
            return;
        }
        match &evt {
            Event::MessageEnd(_) => self.buffered_complete += 1,
            Event::StreamEnd(_) => {
                if self.started_in_buffer() {
                    self.buffer.push(Event::message_end(None));
                    self.buffered_complete += 1;
                }
                return;
            }
            _ => {}
        }
        self.buffer.push(evt);
    }

    fn started_in_buffer(&self) -> bool {
        let mut open = false;
        for evt in &self.buffer {
            match evt {
                Event::MessageStart(_) => open = true,
                Event::MessageEnd(_) => open = false,
                _ => {}
            }
        }
        open
    }

    /// Replays buffered responses once this receiver reaches the head.
    /// Returns true when the receiver has fully completed.
    fn flush(&mut self, out: &mut dyn FnMut(Event)) -> bool {
        for evt in std::mem::replace(&mut self.buffer, Vec::new()) {
            self.forward(evt, out);
        }
        self.buffered_complete = 0;
        self.remaining == 0
    }
}

impl DemuxQueue {
    pub fn new(options: DemuxOptions) -> DemuxQueue {
        DemuxQueue {
            options,
            next_seq: 0,
            current: None,
            oneway: None,
            receivers: VecDeque::new(),
            input_buffer: VecDeque::new(),
            waiting_output_requested: false,
            waiting_output: false,
            closed_tap: None,
            dedicate_flag: Rc::new(Cell::new(false)),
            dedicated: None,
            shutdown: false,
            closed: false,
            stream_end: None,
            message_count: 0,
        }
    }

    /// Shared flag a downstream party sets to upgrade the transport: from the
    /// next response boundary on, the queue retires ordering machinery and
    /// dedicates the transport to the current stream.
    pub fn dedicate_handle(&self) -> Rc<Cell<bool>> {
        self.dedicate_flag.clone()
    }

    /// Requests a graceful close: once all pending receivers drain, the queue
    /// emits `StreamEnd` downstream.
    pub fn shutdown(&mut self, out: &mut dyn FnMut(Event)) {
        if self.closed {
            return;
        }
        if self.receivers.is_empty() {
            out(Event::stream_end(None));
            self.close();
        } else {
            self.shutdown = true;
        }
    }

    /// Number of requests still awaiting responses.
    pub fn pending(&self) -> usize {
        self.receivers.len()
    }

    /// Feeds a response event for the request identified by `seq`. Used by
    /// the internal feed path and by asynchronous sub-pipeline drivers.
    pub fn reply(&mut self, seq: u64, evt: Event, out: &mut dyn FnMut(Event)) {
        if self.closed {
            return;
        }
        if let Some(r) = self.dedicated.as_mut() {
            if r.seq == seq {
                out(evt);
            }
            return;
        }
        let pos = match self.receivers.iter().position(|r| r.seq == seq) {
            Some(p) => p,
            None => return,
        };
        if pos == 0 {
            let head = &mut self.receivers[0];
            let ended = matches!(evt, Event::StreamEnd(_));
            let completed = head.forward(evt, out);
            if completed && self.check_dedicated(out) {
                return;
            }
            if completed && self.receivers[0].remaining == 0 {
                self.shift(out);
            } else if ended {
                // Sub-pipeline died before completing its response count.
                if self.receivers[0].remaining > 0 {
                    out(Event::stream_end(None));
                    self.close();
                }
            }
        } else {
            self.receivers[pos].stash(evt);
        }
    }

    fn shift(&mut self, out: &mut dyn FnMut(Event)) {
        self.receivers.pop_front();
        while let Some(head) = self.receivers.front_mut() {
            if !head.flush(out) {
                break;
            }
            self.receivers.pop_front();
        }
        if self.receivers.is_empty() {
            self.continue_input();
            if let Some(eos) = self.stream_end.take() {
                out(eos);
                self.close();
            } else if self.shutdown {
                out(Event::stream_end(None));
                self.close();
            }
        }
    }

    fn close(&mut self) {
        self.receivers.clear();
        self.stream_end = None;
        self.closed = true;
    }

    fn check_dedicated(&mut self, out: &mut dyn FnMut(Event)) -> bool {
        if self.dedicated.is_some() {
            return true;
        }
        if !self.dedicate_flag.get() {
            return false;
        }
        // Dedicate to the stream at the head of the queue; everything queued
        // behind it is abandoned.
        if let Some(head) = self.receivers.pop_front() {
            self.receivers.clear();
            self.continue_input();
            if let Some(eos) = self.stream_end.take() {
                let mut dedicated = head;
                Self::feed_receiver(&mut dedicated, eos, out);
                self.close();
                return true;
            }
            self.dedicated = Some(head);
            true
        } else {
            false
        }
    }

    fn wait_output(&mut self, ctx: &mut FilterCtx) {
        if !self.waiting_output {
            self.waiting_output = true;
            ctx.tap.close();
            self.closed_tap = Some(ctx.tap.clone());
        }
    }

    fn continue_input(&mut self) {
        if self.waiting_output {
            self.waiting_output = false;
            if let Some(tap) = self.closed_tap.take() {
                tap.open();
            }
        }
    }

    fn feed_receiver(receiver: &mut Receiver, evt: Event, out: &mut dyn FnMut(Event)) {
        if let Some(p) = receiver.pipeline.as_mut() {
            p.input(evt, out);
        }
    }

    /// Feeds an inbound event into the sub-pipeline for request `seq`,
    /// routing everything it emits back through `reply`.
    fn feed(&mut self, seq: u64, evt: Event, _ctx: &mut FilterCtx, out: &mut dyn FnMut(Event)) {
        let mut replies = Vec::new();
        let dedicated_match = self.dedicated.as_ref().map_or(false, |r| r.seq == seq);
        let target = if dedicated_match {
            self.dedicated.as_mut()
        } else {
            self.receivers.iter_mut().find(|r| r.seq == seq)
        };
        if let Some(r) = target {
            Self::feed_receiver(r, evt, &mut |e| replies.push(e));
        }
        for e in replies {
            self.reply(seq, e, out);
        }
    }

    fn queue_event(&mut self, ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::MessageStart(start) => {
                if self.current.is_some() || self.oneway.is_some() {
                    return;
                }
                self.message_count += 1;
                let seq = self.next_seq;
                self.next_seq += 1;
                let pipeline = ctx.sub_pipeline(0);
                if self.options.wait_output {
                    self.waiting_output_requested = true;
                }
                if self.options.output_count > 0 {
                    self.receivers.push_back(Receiver {
                        seq,
                        pipeline: Some(pipeline),
                        remaining: self.options.output_count,
                        started: false,
                        buffer: Vec::new(),
                        buffered_complete: 0,
                    });
                    self.current = Some(seq);
                    self.feed(seq, Event::MessageStart(start), ctx, out);
                } else {
                    // Fire-and-forget: responses are discarded and nothing
                    // queues behind this request.
                    let mut p = pipeline;
                    p.input(Event::MessageStart(start), &mut |_| {});
                    self.oneway = Some(p);
                    self.current = Some(seq);
                }
            }
            Event::Data(data) => {
                if let Some(p) = self.oneway.as_mut() {
                    p.input(Event::Data(data), &mut |_| {});
                } else if let Some(seq) = self.current {
                    self.feed(seq, Event::Data(data), ctx, out);
                }
            }
            Event::MessageEnd(end) => {
                if let Some(mut p) = self.oneway.take() {
                    p.input(Event::MessageEnd(end), &mut |_| {});
                    p.input(Event::stream_end(None), &mut |_| {});
                    self.current = None;
                } else if let Some(seq) = self.current.take() {
                    if self.waiting_output_requested {
                        self.waiting_output_requested = false;
                        self.wait_output(ctx);
                    }
                    self.feed(seq, Event::MessageEnd(end), ctx, out);
                    if self.dedicated.is_none() {
                        self.feed(seq, Event::stream_end(None), ctx, out);
                    } else {
                        self.current = Some(seq);
                    }
                }
                if self.options.max_messages > 0 && self.message_count >= self.options.max_messages
                {
                    self.shutdown(out);
                }
            }
            Event::StreamEnd(eos) => {
                if let Some(mut p) = self.oneway.take() {
                    p.input(Event::StreamEnd(eos.clone()), &mut |_| {});
                    self.current = None;
                } else if let Some(seq) = self.current.take() {
                    if self.dedicated.is_none() {
                        self.feed(seq, Event::message_end(None), ctx, out);
                    }
                    self.feed(seq, Event::StreamEnd(eos.clone()), ctx, out);
                }
                if self.receivers.is_empty() && self.dedicated.is_none() {
                    out(Event::StreamEnd(eos));
                    self.close();
                } else {
                    self.stream_end = Some(Event::StreamEnd(eos));
                }
            }
        }
    }

    /// Replays input deferred while the queue was waiting on output.
    pub fn pump(&mut self, ctx: &mut FilterCtx, out: &mut dyn FnMut(Event)) {
        while !self.waiting_output {
            match self.input_buffer.pop_front() {
                Some(evt) => self.queue_event(ctx, evt, out),
                None => break,
            }
        }
    }
}

impl Filter for DemuxQueue {
    fn process(&mut self, ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        if self.closed {
            return;
        }
        if let Some(seq) = self.dedicated.as_ref().map(|r| r.seq) {
            self.feed(seq, evt, ctx, out);
            return;
        }
        self.pump(ctx, out);
        if self.waiting_output {
            self.input_buffer.push_back(evt);
            return;
        }
        self.queue_event(ctx, evt, out);
    }

    fn reset(&mut self) {
        self.next_seq = 0;
        self.current = None;
        self.oneway = None;
        self.receivers.clear();
        self.input_buffer.clear();
        self.waiting_output_requested = false;
        self.waiting_output = false;
        self.closed_tap = None;
        self.dedicate_flag.set(false);
        self.dedicated = None;
        self.shutdown = false;
        self.closed = false;
        self.stream_end = None;
        self.message_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::pipeline::PipelineLayout;

    /// Echoes each request message back as its response.
    struct Echo;

    impl Filter for Echo {
        fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
            match evt {
                Event::StreamEnd(_) => {}
                other => out(other),
            }
        }
    }

    /// Swallows everything; responses come from outside via `reply`.
    struct Sink;

    impl Filter for Sink {
        fn process(&mut self, _ctx: &mut FilterCtx, _evt: Event, _out: &mut dyn FnMut(Event)) {}
    }

    fn demux_layout<F: Filter + 'static>(
        options: DemuxOptions,
        sub: impl Fn() -> F + 'static,
    ) -> std::rc::Rc<PipelineLayout> {
        let child = PipelineLayout::new("handler").append(sub).shared();
        PipelineLayout::new("demux")
            .append(move || DemuxQueue::new(options.clone()))
            .child(child)
            .shared()
    }

    fn message(body: &str) -> Vec<Event> {
        vec![
            Event::message_start(None),
            Event::Data(Data::from_slice(body.as_bytes())),
            Event::message_end(None),
        ]
    }

    fn body_text(events: &[Event]) -> Vec<String> {
        let mut out = Vec::new();
        let mut cur = String::new();
        for evt in events {
            match evt {
                Event::Data(d) => cur.push_str(&d.to_string_lossy()),
                Event::MessageEnd(_) => out.push(std::mem::replace(&mut cur, String::new())),
                _ => {}
            }
        }
        out
    }

    #[test]
    fn test_echo_in_order() {
        let layout = demux_layout(DemuxOptions::default(), || Echo);
        let mut p = Pipeline::new(layout, None);

        let mut got = Vec::new();
        for evt in message("a").into_iter().chain(message("b")) {
            p.input(evt, &mut |e| got.push(e));
        }
        assert_eq!(body_text(&got), vec!["a", "b"]);
    }

    #[test]
    fn test_out_of_order_responses_are_reordered() {
        // Scenario: requests A, B, C; responses emitted in order C, A, B.
        // The transport must observe A, B, C.
        let mut queue = DemuxQueue::new(DemuxOptions::default());
        let child = PipelineLayout::new("handler").append(|| Sink).shared();
        let layout = PipelineLayout::new("demux").child(child).shared();
        let mut ctx = FilterCtx::with_layout(None, layout);

        let mut got = Vec::new();
        {
            let mut out = |e: Event| got.push(e);
            for name in ["A", "B", "C"].iter() {
                for evt in message(name) {
                    queue.process(&mut ctx, evt, &mut out);
                }
            }
            for seq in [2u64, 0, 1].iter().copied() {
                for evt in message(&format!("resp-{}", seq)) {
                    queue.reply(seq, evt, &mut out);
                }
            }
        }
        assert_eq!(body_text(&got), vec!["resp-0", "resp-1", "resp-2"]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_queue_depth_one_serializes() {
        // wait_output defers the second request until the first responds.
        let mut options = DemuxOptions::default();
        options.wait_output = true;
        let mut queue = DemuxQueue::new(options);
        let child = PipelineLayout::new("handler").append(|| Sink).shared();
        let layout = PipelineLayout::new("demux").child(child).shared();
        let mut ctx = FilterCtx::with_layout(None, layout);

        let mut got = Vec::new();
        {
            let mut out = |e: Event| got.push(e);
            for evt in message("A") {
                queue.process(&mut ctx, evt, &mut out);
            }
            assert!(!ctx.tap.is_open());
            // B arrives while waiting; it must be deferred, not dispatched.
            for evt in message("B") {
                queue.process(&mut ctx, evt, &mut out);
            }
            assert_eq!(queue.pending(), 1);

            for evt in message("resp-A") {
                queue.reply(0, evt, &mut out);
            }
            queue.pump(&mut ctx, &mut out);
            assert_eq!(queue.pending(), 1); // B dispatched now

            for evt in message("resp-B") {
                queue.reply(1, evt, &mut out);
            }
        }
        assert_eq!(body_text(&got), vec!["resp-A", "resp-B"]);
    }

    #[test]
    fn test_fire_and_forget_does_not_stall() {
        let mut options = DemuxOptions::default();
        options.output_count = 0;
        let layout = demux_layout(options, || Echo);
        let mut p = Pipeline::new(layout, None);

        let mut got = Vec::new();
        for evt in message("a").into_iter().chain(message("b")) {
            p.input(evt, &mut |e| got.push(e));
        }
        // Responses are discarded entirely; nothing stalls, nothing emits.
        assert!(got.is_empty());
    }

    #[test]
    fn test_stream_end_passes_through_when_drained() {
        let layout = demux_layout(DemuxOptions::default(), || Echo);
        let mut p = Pipeline::new(layout, None);

        let mut got = Vec::new();
        for evt in message("a").into_iter().chain(vec![Event::stream_end(None)]) {
            p.input(evt, &mut |e| got.push(e));
        }
        assert!(matches!(got.last(), Some(Event::StreamEnd(_))));
    }
}
