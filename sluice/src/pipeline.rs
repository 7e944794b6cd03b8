use std::cell::Cell;
use std::rc::Rc;

use slog::{o, Discard, Logger};

use crate::event::Event;

/// Cooperative backpressure flag on an input endpoint. Closing it asks the
/// upstream producer to stop calling; it never cancels events already in
/// flight.
pub struct Tap {
    open: Cell<bool>,
    dirty: Cell<bool>,
}

impl Tap {
    pub fn new() -> Rc<Tap> {
        Rc::new(Tap {
            open: Cell::new(true),
            dirty: Cell::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    pub fn close(&self) {
        if self.open.replace(false) {
            self.dirty.set(true);
        }
    }

    pub fn open(&self) {
        if !self.open.replace(true) {
            self.dirty.set(true);
        }
    }

    /// True once after each state change; producers poll this to re-arm
    /// their read interest.
    pub fn take_dirty(&self) -> bool {
        self.dirty.replace(false)
    }
}

/// A stateful unit consuming events on its input and emitting events on its
/// output. Filters never fail across this boundary; errors travel as
/// `StreamEnd { error }` events.
pub trait Filter {
    fn process(&mut self, ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event));

    /// Called when the owning pipeline is returned for reuse. Implementations
    /// drop buffered state; the default suits stateless filters.
    fn reset(&mut self) {}
}

/// Shared state a live pipeline hands to its filters: the input tap, a
/// logger, and the layout for sub-pipeline construction.
pub struct FilterCtx {
    pub tap: Rc<Tap>,
    pub log: Logger,
    layout: Option<Rc<PipelineLayout>>,
}

impl FilterCtx {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> FilterCtx {
        let log = match log.into() {
            Some(log) => log.new(o!()),
            None => Logger::root(Discard, o!()),
        };
        FilterCtx {
            tap: Tap::new(),
            log,
            layout: None,
        }
    }

    /// A context bound to a layout, for driving a filter outside a live
    /// pipeline (embedding, tests).
    pub fn with_layout<'a, L: Into<Option<&'a Logger>>>(
        log: L,
        layout: Rc<PipelineLayout>,
    ) -> FilterCtx {
        let mut ctx = FilterCtx::new(log);
        ctx.layout = Some(layout);
        ctx
    }

    /// The `i`-th child layout of the owning pipeline's blueprint.
    pub fn sub_layout(&self, i: usize) -> Rc<PipelineLayout> {
        self.layout
            .as_ref()
            .expect("filter is running inside a pipeline")
            .children[i]
            .clone()
    }

    /// Instantiates a fresh sub-pipeline from child layout `i`. A filter that
    /// wants `share = true` semantics holds on to the instance instead.
    pub fn sub_pipeline(&self, i: usize) -> Pipeline {
        let layout = self.sub_layout(i);
        Pipeline::new_with(layout, self.tap.clone(), &self.log)
    }
}

type FilterBuilder = Box<dyn Fn() -> Box<dyn Filter>>;

/// A blueprint: an ordered list of filter prototypes plus child layouts.
/// Instantiation produces live filters; the layout itself stays immutable
/// and shared.
pub struct PipelineLayout {
    name: String,
    builders: Vec<FilterBuilder>,
    children: Vec<Rc<PipelineLayout>>,
}

impl PipelineLayout {
    pub fn new(name: &str) -> PipelineLayout {
        PipelineLayout {
            name: name.to_string(),
            builders: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a filter prototype.
    pub fn append<F: Filter + 'static>(
        mut self,
        build: impl Fn() -> F + 'static,
    ) -> PipelineLayout {
        self.builders.push(Box::new(move || Box::new(build())));
        self
    }

    /// Registers a child layout reachable from filters via
    /// `FilterCtx::sub_pipeline`.
    pub fn child(mut self, layout: Rc<PipelineLayout>) -> PipelineLayout {
        self.children.push(layout);
        self
    }

    pub fn shared(self) -> Rc<PipelineLayout> {
        Rc::new(self)
    }
}

/// A live chain of filter instances sharing a context. Exactly one input;
/// the tail's output goes to the receiver supplied per `input` call.
pub struct Pipeline {
    filters: Vec<Box<dyn Filter>>,
    ctx: FilterCtx,
    ended: bool,
}

impl Pipeline {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(layout: Rc<PipelineLayout>, log: L) -> Pipeline {
        let ctx = FilterCtx::new(log);
        Self::with_ctx(layout, ctx)
    }

    fn new_with(layout: Rc<PipelineLayout>, tap: Rc<Tap>, log: &Logger) -> Pipeline {
        let mut ctx = FilterCtx::new(log);
        ctx.tap = tap;
        Self::with_ctx(layout, ctx)
    }

    fn with_ctx(layout: Rc<PipelineLayout>, mut ctx: FilterCtx) -> Pipeline {
        let filters = layout.builders.iter().map(|b| b()).collect();
        ctx.layout = Some(layout);
        Pipeline {
            filters,
            ctx,
            ended: false,
        }
    }

    pub fn tap(&self) -> Rc<Tap> {
        self.ctx.tap.clone()
    }

    pub fn log(&self) -> &Logger {
        &self.ctx.log
    }

    /// Feeds one event to the head filter; everything the tail emits flows
    /// to `out`, in emission order, synchronously.
    pub fn input(&mut self, evt: Event, out: &mut dyn FnMut(Event)) {
        if self.ended {
            return;
        }
        let mut events = vec![evt];
        let mut next = Vec::new();
        for i in 0..self.filters.len() {
            if events.is_empty() {
                return;
            }
            let filter = &mut self.filters[i];
            for e in events.drain(..) {
                filter.process(&mut self.ctx, e, &mut |o| next.push(o));
            }
            std::mem::swap(&mut events, &mut next);
        }
        for e in events.drain(..) {
            if self.ended {
                return;
            }
            if let Event::StreamEnd(_) = e {
                self.ended = true;
                out(e);
                return;
            }
            out(e);
        }
    }

    /// Returns the pipeline to a reusable state: all filters reset, no
    /// pending terminal marker.
    pub fn reset(&mut self) {
        for f in self.filters.iter_mut() {
            f.reset();
        }
        self.ended = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;

    /// Doubles every data chunk by emitting it twice.
    struct Repeat;

    impl Filter for Repeat {
        fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
            match evt {
                Event::Data(d) => {
                    out(Event::Data(d.clone()));
                    out(Event::Data(d));
                }
                other => out(other),
            }
        }
    }

    /// Counts events and forwards them.
    struct Count {
        seen: usize,
    }

    impl Filter for Count {
        fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
            self.seen += 1;
            out(evt);
        }

        fn reset(&mut self) {
            self.seen = 0;
        }
    }

    fn collect(pipeline: &mut Pipeline, events: Vec<Event>) -> Vec<Event> {
        let mut got = Vec::new();
        for evt in events {
            pipeline.input(evt, &mut |e| got.push(e));
        }
        got
    }

    #[test]
    fn test_chaining_order() {
        let layout = PipelineLayout::new("test")
            .append(|| Repeat)
            .append(|| Repeat)
            .shared();
        let mut p = Pipeline::new(layout, None);

        let got = collect(&mut p, vec![Event::Data(Data::from_slice(b"x"))]);
        // Two repeats quadruple the chunk.
        assert_eq!(got.len(), 4);
    }

    #[test]
    fn test_nothing_after_stream_end() {
        let layout = PipelineLayout::new("test").append(|| Repeat).shared();
        let mut p = Pipeline::new(layout, None);

        let got = collect(
            &mut p,
            vec![
                Event::stream_end(None),
                Event::Data(Data::from_slice(b"late")),
            ],
        );
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], Event::StreamEnd(_)));
    }

    #[test]
    fn test_reset_restores_input() {
        let layout = PipelineLayout::new("test").append(|| Count { seen: 0 }).shared();
        let mut p = Pipeline::new(layout, None);

        collect(&mut p, vec![Event::stream_end(None)]);
        assert!(collect(&mut p, vec![Event::message_start(None)]).is_empty());

        p.reset();
        assert_eq!(collect(&mut p, vec![Event::message_start(None)]).len(), 1);
    }

    #[test]
    fn test_sub_pipeline_instantiation() {
        struct Wrap {
            inner: Option<Pipeline>,
        }

        impl Filter for Wrap {
            fn process(&mut self, ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
                // share = true: one child reused across calls.
                let inner = self.inner.get_or_insert_with(|| ctx.sub_pipeline(0));
                inner.input(evt, out);
            }

            fn reset(&mut self) {
                self.inner = None;
            }
        }

        let child = PipelineLayout::new("child").append(|| Repeat).shared();
        let layout = PipelineLayout::new("parent")
            .append(|| Wrap { inner: None })
            .child(child)
            .shared();
        let mut p = Pipeline::new(layout, None);

        let got = collect(&mut p, vec![Event::Data(Data::from_slice(b"y"))]);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_tap_state_changes() {
        let tap = Tap::new();
        assert!(tap.is_open());
        assert!(!tap.take_dirty());

        tap.close();
        assert!(!tap.is_open());
        assert!(tap.take_dirty());
        assert!(!tap.take_dirty());

        tap.close(); // no-op, already closed
        assert!(!tap.take_dirty());

        tap.open();
        assert!(tap.is_open());
        assert!(tap.take_dirty());
    }
}
