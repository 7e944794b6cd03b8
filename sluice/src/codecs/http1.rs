use crate::data::{Data, CHUNK_SIZE};
use crate::event::{
    ErrorKind, Event, Headers, MessageHead, MessageTail, RequestHead, ResponseHead,
};
use crate::pipeline::{Filter, FilterCtx};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Head,
    Header,
    Body,
    BodyToEnd,
    ChunkHead,
    ChunkBody,
    ChunkTail,
    ChunkLast,
    Trailer,
    Done,
}

/// HTTP/1.x decoder: turns wire bytes into message events. Handles
/// Content-Length and chunked framing, with body bytes passed through
/// untouched.
pub struct Decoder {
    is_response: bool,
    state: State,
    line: Data,
    head: Option<MessageHead>,
    trailers: Headers,
    body_left: usize,
    chunk_left: usize,
    head_size: usize,
    max_header_size: usize,
    has_error: bool,
}

impl Decoder {
    pub fn new(is_response: bool) -> Decoder {
        Decoder {
            is_response,
            state: State::Head,
            line: Data::new(),
            head: None,
            trailers: Headers::new(),
            body_left: 0,
            chunk_left: 0,
            head_size: 0,
            max_header_size: CHUNK_SIZE,
            has_error: false,
        }
    }

    pub fn set_max_header_size(&mut self, size: usize) {
        self.max_header_size = size;
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    fn error(&mut self, out: &mut dyn FnMut(Event)) {
        self.has_error = true;
        self.state = State::Done;
        out(Event::stream_end(Some(ErrorKind::ProtocolError)));
    }

    /// Takes one CRLF (or bare LF) terminated line out of the accumulator.
    fn take_line(&mut self) -> String {
        let mut bytes = self.line.to_vec();
        self.line.clear();
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn parse_start_line(&mut self, line: &str) -> Option<MessageHead> {
        let mut parts = line.splitn(3, ' ');
        if self.is_response {
            let protocol = parts.next()?.to_string();
            let status: u16 = parts.next()?.parse().ok()?;
            let status_text = parts.next().unwrap_or("").to_string();
            if !protocol.starts_with("HTTP/") {
                return None;
            }
            Some(MessageHead::Response(ResponseHead {
                protocol,
                status,
                status_text,
                headers: Headers::new(),
            }))
        } else {
            let method = parts.next()?.to_string();
            let path = parts.next()?.to_string();
            let protocol = parts.next()?.to_string();
            if method.is_empty() || !protocol.starts_with("HTTP/") {
                return None;
            }
            Some(MessageHead::Request(RequestHead {
                protocol,
                method,
                path,
                scheme: None,
                authority: None,
                headers: Headers::new(),
            }))
        }
    }

    fn head_headers(&mut self) -> &mut Headers {
        match self.head.as_mut().expect("head is being decoded") {
            MessageHead::Request(h) => &mut h.headers,
            MessageHead::Response(h) => &mut h.headers,
            _ => unreachable!("http decoder only builds http heads"),
        }
    }

    /// Decides the body framing once the header block completes.
    fn message_start(&mut self, out: &mut dyn FnMut(Event)) {
        let head = self.head.take().expect("header block was parsed");
        let (content_length, chunked, no_body) = {
            let headers = match &head {
                MessageHead::Request(h) => &h.headers,
                MessageHead::Response(h) => &h.headers,
                _ => unreachable!(),
            };
            let chunked = headers
                .get("transfer-encoding")
                .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"));
            let content_length = headers
                .get("content-length")
                .and_then(|v| v.trim().parse::<usize>().ok());
            let no_body = match &head {
                MessageHead::Response(h) => {
                    h.status / 100 == 1 || h.status == 204 || h.status == 304
                }
                MessageHead::Request(_) => !chunked && content_length.is_none(),
                _ => unreachable!(),
            };
            (content_length, chunked, no_body)
        };
        let is_response = matches!(head, MessageHead::Response(_));
        out(Event::message_start(Some(head)));
        if chunked {
            self.state = State::ChunkHead;
        } else if let Some(n) = content_length {
            if n == 0 {
                self.message_end(out);
            } else {
                self.body_left = n;
                self.state = State::Body;
            }
        } else if no_body {
            self.message_end(out);
        } else if is_response {
            // Response with no framing info: body runs to connection close.
            self.state = State::BodyToEnd;
        } else {
            self.message_end(out);
        }
    }

    fn message_end(&mut self, out: &mut dyn FnMut(Event)) {
        let tail = if self.trailers.len() > 0 {
            Some(MessageTail::Http(std::mem::take(&mut self.trailers)))
        } else {
            None
        };
        out(Event::message_end(tail));
        self.state = State::Head;
        self.head_size = 0;
    }

    fn parse(&mut self, data: &mut Data, out: &mut dyn FnMut(Event)) {
        while !data.is_empty() && self.state != State::Done {
            match self.state {
                State::Head | State::Header | State::ChunkHead | State::ChunkTail
                | State::ChunkLast | State::Trailer => {
                    let before = self.line.len();
                    data.shift_until(|c| c == b'\n', &mut self.line);
                    self.head_size += self.line.len() - before;
                    if self.max_header_size > 0 && self.head_size > self.max_header_size {
                        self.error(out);
                        return;
                    }
                    let complete = {
                        let mut last = 0u8;
                        self.line.for_each_chunk(|s| {
                            if let Some(&c) = s.last() {
                                last = c;
                            }
                        });
                        last == b'\n'
                    };
                    if !complete {
                        return;
                    }
                    let line = self.take_line();
                    self.handle_line(line, out);
                }
                State::Body => {
                    let take = self.body_left.min(data.len());
                    let mut body = Data::new();
                    data.shift_to(take, &mut body);
                    self.body_left -= take;
                    if !body.is_empty() {
                        out(Event::Data(body));
                    }
                    if self.body_left == 0 {
                        self.message_end(out);
                    }
                }
                State::BodyToEnd => {
                    let body = std::mem::replace(data, Data::new());
                    if !body.is_empty() {
                        out(Event::Data(body));
                    }
                }
                State::ChunkBody => {
                    let take = self.chunk_left.min(data.len());
                    let mut body = Data::new();
                    data.shift_to(take, &mut body);
                    self.chunk_left -= take;
                    if !body.is_empty() {
                        out(Event::Data(body));
                    }
                    if self.chunk_left == 0 {
                        self.state = State::ChunkTail;
                    }
                }
                State::Done => return,
            }
        }
    }

    fn handle_line(&mut self, line: String, out: &mut dyn FnMut(Event)) {
        match self.state {
            State::Head => {
                if line.is_empty() {
                    return; // tolerate leading blank lines
                }
                match self.parse_start_line(&line) {
                    Some(head) => {
                        self.head = Some(head);
                        self.trailers = Headers::new();
                        self.state = State::Header;
                    }
                    None => self.error(out),
                }
            }
            State::Header => {
                if line.is_empty() {
                    self.message_start(out);
                } else {
                    match split_header(&line) {
                        Some((k, v)) => self.head_headers().push(k, v),
                        None => self.error(out),
                    }
                }
            }
            State::ChunkHead => {
                let size_str = line.split(';').next().unwrap_or("").trim();
                match usize::from_str_radix(size_str, 16) {
                    Ok(0) => self.state = State::Trailer,
                    Ok(n) => {
                        self.chunk_left = n;
                        self.state = State::ChunkBody;
                    }
                    Err(_) => self.error(out),
                }
            }
            State::ChunkTail => {
                if line.is_empty() {
                    self.state = State::ChunkHead;
                } else {
                    self.error(out);
                }
            }
            State::Trailer | State::ChunkLast => {
                if line.is_empty() {
                    self.message_end(out);
                } else {
                    match split_header(&line) {
                        Some((k, v)) => self.trailers.push(k, v),
                        None => self.error(out),
                    }
                }
            }
            _ => {}
        }
    }
}

fn split_header(line: &str) -> Option<(String, String)> {
    let idx = line.find(':')?;
    let (k, v) = line.split_at(idx);
    if k.is_empty() {
        return None;
    }
    Some((k.to_string(), v[1..].trim().to_string()))
}

impl Filter for Decoder {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::Data(mut data) => {
                if !self.has_error {
                    self.parse(&mut data, out);
                }
            }
            Event::StreamEnd(eos) => {
                match self.state {
                    State::BodyToEnd => {
                        // Close delimits the body.
                        self.message_end(out);
                    }
                    State::Head | State::Done => {}
                    _ => {
                        // Mid-message close is a protocol error.
                        self.has_error = true;
                        out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                        self.state = State::Done;
                        return;
                    }
                }
                out(Event::StreamEnd(eos));
                self.state = State::Done;
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        let is_response = self.is_response;
        let max = self.max_header_size;
        *self = Decoder::new(is_response);
        self.max_header_size = max;
    }
}

/// HTTP/1.x encoder: serializes message events back to wire bytes. Bodies
/// buffered up to `buffer_size` go out with a Content-Length; longer ones
/// switch to chunked streaming.
pub struct Encoder {
    is_response: bool,
    buffer_size: usize,
    head: Option<MessageHead>,
    buffer: Data,
    chunked: bool,
    started: bool,
}

impl Encoder {
    pub fn new(is_response: bool) -> Encoder {
        Encoder {
            is_response,
            buffer_size: CHUNK_SIZE,
            head: None,
            buffer: Data::new(),
            chunked: false,
            started: false,
        }
    }

    pub fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size;
    }

    fn write_head(&mut self, content_length: Option<usize>, out: &mut dyn FnMut(Event)) {
        let head = self.head.as_ref().expect("message was started");
        let mut bytes = Data::new();
        let headers = match head {
            MessageHead::Response(h) => {
                bytes.push_str(&format!(
                    "{} {} {}\r\n",
                    h.protocol, h.status, h.status_text
                ));
                &h.headers
            }
            MessageHead::Request(h) => {
                bytes.push_str(&format!("{} {} {}\r\n", h.method, h.path, h.protocol));
                &h.headers
            }
            _ => return,
        };
        for (k, v) in headers.iter() {
            if k.eq_ignore_ascii_case("content-length") || k.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            bytes.push_str(&format!("{}: {}\r\n", k, v));
        }
        match content_length {
            Some(n) => {
                if n > 0 || !matches!(head, MessageHead::Request(_)) {
                    bytes.push_str(&format!("content-length: {}\r\n", n));
                }
            }
            None => bytes.push_str("transfer-encoding: chunked\r\n"),
        }
        bytes.push_str("\r\n");
        out(Event::Data(bytes));
    }

    fn write_chunk(data: Data, out: &mut dyn FnMut(Event)) {
        if data.is_empty() {
            return;
        }
        let mut framed = Data::new();
        framed.push_str(&format!("{:x}\r\n", data.len()));
        framed.push(data);
        framed.push_str("\r\n");
        out(Event::Data(framed));
    }

    fn write_last_chunk(trailers: Option<&Headers>, out: &mut dyn FnMut(Event)) {
        let mut bytes = Data::new();
        bytes.push_str("0\r\n");
        if let Some(trailers) = trailers {
            for (k, v) in trailers.iter() {
                bytes.push_str(&format!("{}: {}\r\n", k, v));
            }
        }
        bytes.push_str("\r\n");
        out(Event::Data(bytes));
    }
}

impl Filter for Encoder {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::MessageStart(start) => {
                if self.started {
                    return;
                }
                self.started = true;
                self.chunked = false;
                self.buffer.clear();
                self.head = match start.head {
                    Some(h @ MessageHead::Request(_)) | Some(h @ MessageHead::Response(_)) => {
                        Some(h)
                    }
                    _ => {
                        if self.is_response {
                            Some(MessageHead::Response(ResponseHead::default()))
                        } else {
                            Some(MessageHead::Request(RequestHead::default()))
                        }
                    }
                };
                // Heads that declare chunked stream immediately.
                if let Some(head) = &self.head {
                    let headers = match head {
                        MessageHead::Request(h) => &h.headers,
                        MessageHead::Response(h) => &h.headers,
                        _ => unreachable!(),
                    };
                    if headers
                        .get("transfer-encoding")
                        .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"))
                    {
                        self.chunked = true;
                        self.write_head(None, out);
                    }
                }
            }
            Event::Data(data) => {
                if !self.started {
                    return;
                }
                if self.chunked {
                    Self::write_chunk(data, out);
                } else {
                    self.buffer.push(data);
                    if self.buffer.len() > self.buffer_size {
                        self.chunked = true;
                        self.write_head(None, out);
                        Self::write_chunk(self.buffer.take_all(), out);
                    }
                }
            }
            Event::MessageEnd(end) => {
                if !self.started {
                    return;
                }
                if self.chunked {
                    let trailers = match &end.tail {
                        Some(MessageTail::Http(t)) => Some(t),
                        _ => None,
                    };
                    Self::write_last_chunk(trailers, out);
                } else {
                    self.write_head(Some(self.buffer.len()), out);
                    let body = self.buffer.take_all();
                    if !body.is_empty() {
                        out(Event::Data(body));
                    }
                }
                self.started = false;
                self.head = None;
            }
            Event::StreamEnd(eos) => {
                if self.started && self.chunked {
                    Self::write_last_chunk(None, out);
                }
                self.started = false;
                out(Event::StreamEnd(eos));
            }
        }
    }

    fn reset(&mut self) {
        self.head = None;
        self.buffer.clear();
        self.chunked = false;
        self.started = false;
    }
}

/// Protocol choice callback for `HttpMux`: inspects the first request head.
pub type VersionSelector = Box<dyn Fn(&crate::event::MessageStart) -> HttpVersion>;

use crate::config::HttpVersion;
use std::collections::VecDeque;

enum MuxProtocol {
    Undecided(Option<VersionSelector>),
    H1 {
        encoder: Encoder,
        decoder: Decoder,
        queue: VecDeque<u32>,
        outputs: hashbrown::HashMap<u32, Vec<Event>>,
    },
    H2(crate::codecs::http2::Http2Client),
}

/// HTTP mux session: packs request streams onto one transport, deferring the
/// HTTP/1.1-vs-HTTP/2 decision until the first request when a selector is
/// installed. HTTP/1 streams are serialized in order with FIFO response
/// routing; HTTP/2 streams ride the concurrent endpoint.
pub struct HttpMux {
    protocol: MuxProtocol,
    next_id: u32,
    pending_ids: Vec<u32>,
    h2_map: hashbrown::HashMap<u32, u32>,
}

impl HttpMux {
    pub fn new(version: HttpVersion) -> HttpMux {
        let protocol = match version {
            HttpVersion::Http1 => MuxProtocol::h1(),
            HttpVersion::Http2 => {
                MuxProtocol::H2(crate::codecs::http2::Http2Client::new(Default::default()))
            }
        };
        HttpMux {
            protocol,
            next_id: 0,
            pending_ids: Vec::new(),
            h2_map: hashbrown::HashMap::new(),
        }
    }

    /// Defers the protocol choice to `selector`, called with the first
    /// request's start event.
    pub fn with_selector(selector: VersionSelector) -> HttpMux {
        HttpMux {
            protocol: MuxProtocol::Undecided(Some(selector)),
            next_id: 0,
            pending_ids: Vec::new(),
            h2_map: hashbrown::HashMap::new(),
        }
    }

    pub fn open_stream(&mut self) -> u32 {
        match &mut self.protocol {
            MuxProtocol::H2(client) => client.open_stream(),
            MuxProtocol::H1 { queue, outputs, .. } => {
                let id = self.next_id;
                self.next_id += 1;
                queue.push_back(id);
                outputs.insert(id, Vec::new());
                id
            }
            MuxProtocol::Undecided(_) => {
                let id = self.next_id;
                self.next_id += 1;
                self.pending_ids.push(id);
                id
            }
        }
    }

    fn translate(&self, id: u32) -> u32 {
        self.h2_map.get(&id).copied().unwrap_or(id)
    }

    /// Feeds one request event for `id`; wire bytes flush to `out`.
    pub fn stream_input(&mut self, id: u32, evt: Event, out: &mut dyn FnMut(Event)) {
        if let MuxProtocol::Undecided(selector) = &mut self.protocol {
            if let Event::MessageStart(start) = &evt {
                let version = match selector.take() {
                    Some(f) => f(start),
                    None => HttpVersion::Http1,
                };
                self.decide(version);
            } else {
                return;
            }
        }
        match &mut self.protocol {
            MuxProtocol::H1 { encoder, .. } => {
                let mut ctx = FilterCtx::new(None);
                encoder.process(&mut ctx, evt, out);
            }
            MuxProtocol::H2(client) => {
                let hid = self.h2_map.get(&id).copied().unwrap_or(id);
                client.stream_input(hid, evt, out);
            }
            MuxProtocol::Undecided(_) => {}
        }
    }

    /// Materializes the chosen protocol, carrying over every stream handed
    /// out while undecided, in order.
    fn decide(&mut self, version: HttpVersion) {
        let pending = std::mem::take(&mut self.pending_ids);
        self.protocol = match version {
            HttpVersion::Http1 => {
                let mut p = MuxProtocol::h1();
                if let MuxProtocol::H1 { queue, outputs, .. } = &mut p {
                    for id in pending {
                        queue.push_back(id);
                        outputs.insert(id, Vec::new());
                    }
                }
                p
            }
            HttpVersion::Http2 => {
                let mut client = crate::codecs::http2::Http2Client::new(Default::default());
                for id in pending {
                    self.h2_map.insert(id, client.open_stream());
                }
                MuxProtocol::H2(client)
            }
        };
    }

    /// Feeds transport bytes from the server side.
    pub fn process_reply(&mut self, evt: Event, out: &mut dyn FnMut(Event)) {
        match &mut self.protocol {
            MuxProtocol::H1 {
                decoder,
                queue,
                outputs,
                ..
            } => {
                let mut ctx = FilterCtx::new(None);
                let mut decoded = Vec::new();
                decoder.process(&mut ctx, evt, &mut |e| decoded.push(e));
                for e in decoded {
                    let head = match queue.front() {
                        Some(id) => *id,
                        None => break,
                    };
                    let finished = matches!(e, Event::MessageEnd(_));
                    if let Some(buf) = outputs.get_mut(&head) {
                        buf.push(e);
                    }
                    if finished {
                        queue.pop_front();
                    }
                }
            }
            MuxProtocol::H2(client) => client.process_reply(evt, out),
            MuxProtocol::Undecided(_) => {}
        }
    }

    /// Drains buffered response events for `id`.
    pub fn drain_stream(&mut self, id: u32, out: &mut dyn FnMut(Event)) {
        let hid = self.translate(id);
        match &mut self.protocol {
            MuxProtocol::H1 { outputs, .. } => {
                if let Some(buf) = outputs.get_mut(&hid) {
                    for e in buf.drain(..) {
                        out(e);
                    }
                }
            }
            MuxProtocol::H2(client) => client.drain_stream(hid, out),
            MuxProtocol::Undecided(_) => {}
        }
    }
}

impl MuxProtocol {
    fn h1() -> MuxProtocol {
        MuxProtocol::H1 {
            encoder: Encoder::new(false),
            decoder: Decoder::new(true),
            queue: VecDeque::new(),
            outputs: hashbrown::HashMap::new(),
        }
    }
}
