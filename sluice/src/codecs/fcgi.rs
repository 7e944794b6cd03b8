use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;

use crate::data::Data;
use crate::deframer::{Deframe, Deframer, Input, ReadCmd, STATE_ERROR};
use crate::event::{ErrorKind, Event, MessageHead, MessageTail};
use crate::pipeline::{Filter, FilterCtx, Pipeline};

pub const RECORD_HEADER_SIZE: usize = 8;

pub mod record_type {
    pub const BEGIN_REQUEST: u8 = 1;
    pub const ABORT_REQUEST: u8 = 2;
    pub const END_REQUEST: u8 = 3;
    pub const PARAMS: u8 = 4;
    pub const STDIN: u8 = 5;
    pub const STDOUT: u8 = 6;
    pub const STDERR: u8 = 7;
    pub const DATA: u8 = 8;
}

pub const ROLE_RESPONDER: u16 = 1;
pub const FLAG_KEEP_CONN: u8 = 1;
pub const STATUS_REQUEST_COMPLETE: u8 = 0;

/// FastCGI request head: the BEGIN_REQUEST body plus the PARAMS name-value
/// pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FcgiRequestHead {
    pub role: u16,
    pub keep_alive: bool,
    pub params: Vec<(String, String)>,
}

/// FastCGI response trailer: the END_REQUEST body plus collected stderr.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FcgiResponseTail {
    pub app_status: u32,
    pub protocol_status: u8,
    pub stderr: Vec<u8>,
}

fn write_record(out: &mut Data, rtype: u8, request_id: u16, body: Data) {
    let length = body.len();
    let padding = (length + 7) / 8 * 8 - length;
    let mut header = [0u8; RECORD_HEADER_SIZE];
    header[0] = 1;
    header[1] = rtype;
    BigEndian::write_u16(&mut header[2..4], request_id);
    BigEndian::write_u16(&mut header[4..6], length as u16);
    header[6] = padding as u8;
    out.push_slice(&header);
    out.push(body);
    if padding > 0 {
        out.push_slice(&vec![0u8; padding]);
    }
}

/// Name-value pair length prefix: one byte below 0x80, otherwise four bytes
/// with the high bit set.
fn write_pair_len(out: &mut Data, n: usize) {
    if n <= 0x7f {
        out.push_u8(n as u8);
    } else {
        let n = (n as u32) | 0x8000_0000;
        out.push_slice(&n.to_be_bytes());
    }
}

fn read_pair_len(r: &mut crate::data::Reader) -> Option<usize> {
    let first = r.get()?;
    if first & 0x80 == 0 {
        return Some(first as usize);
    }
    let mut rest = [0u8; 3];
    if !r.read_exact(&mut rest) {
        return None;
    }
    Some(
        (((first & 0x7f) as usize) << 24)
            | ((rest[0] as usize) << 16)
            | ((rest[1] as usize) << 8)
            | rest[2] as usize,
    )
}

pub fn encode_params(params: &[(String, String)]) -> Data {
    let mut out = Data::new();
    for (k, v) in params {
        write_pair_len(&mut out, k.len());
        write_pair_len(&mut out, v.len());
        out.push_slice(k.as_bytes());
        out.push_slice(v.as_bytes());
    }
    out
}

pub fn decode_params(data: &Data) -> Option<Vec<(String, String)>> {
    let mut params = Vec::new();
    let mut r = data.reader();
    while r.remaining() > 0 {
        let klen = read_pair_len(&mut r)?;
        let vlen = read_pair_len(&mut r)?;
        let mut k = vec![0u8; klen];
        let mut v = vec![0u8; vlen];
        if !r.read_exact(&mut k) || !r.read_exact(&mut v) {
            return None;
        }
        params.push((
            String::from_utf8_lossy(&k).into_owned(),
            String::from_utf8_lossy(&v).into_owned(),
        ));
    }
    Some(params)
}

// ---- record-level deframing ----

const STATE_HEADER: i32 = 0;
const STATE_BODY: i32 = 1;

struct Record {
    rtype: u8,
    request_id: u16,
    body: Data,
}

struct RecordDecoder {
    rtype: u8,
    request_id: u16,
    padding: usize,
    records: Vec<Record>,
}

impl RecordDecoder {
    fn new() -> RecordDecoder {
        RecordDecoder {
            rtype: 0,
            request_id: 0,
            padding: 0,
            records: Vec::new(),
        }
    }
}

impl Deframe for RecordDecoder {
    fn on_state(
        &mut self,
        state: i32,
        input: Input,
        cmd: &mut ReadCmd,
        _out: &mut dyn FnMut(Event),
    ) -> i32 {
        match (state, input) {
            (STATE_HEADER, Input::Filled(buf)) => {
                self.rtype = buf[1];
                self.request_id = BigEndian::read_u16(&buf[2..4]);
                let length = BigEndian::read_u16(&buf[4..6]) as usize;
                self.padding = buf[6] as usize;
                if length + self.padding > 0 {
                    cmd.fill_data(length + self.padding);
                    STATE_BODY
                } else {
                    self.records.push(Record {
                        rtype: self.rtype,
                        request_id: self.request_id,
                        body: Data::new(),
                    });
                    cmd.fill(RECORD_HEADER_SIZE);
                    STATE_HEADER
                }
            }
            (STATE_BODY, Input::FilledData(mut data)) => {
                if self.padding > 0 {
                    data.pop(self.padding);
                }
                self.records.push(Record {
                    rtype: self.rtype,
                    request_id: self.request_id,
                    body: data,
                });
                cmd.fill(RECORD_HEADER_SIZE);
                STATE_HEADER
            }
            _ => STATE_ERROR,
        }
    }
}

fn new_record_deframer() -> Deframer {
    let mut deframer = Deframer::new(STATE_HEADER);
    deframer.arm(|cmd| cmd.fill(RECORD_HEADER_SIZE));
    deframer
}

// ---- server ----

struct ServerRequest {
    pipeline: Pipeline,
    role: u16,
    keep_alive: bool,
    params_buffer: Data,
    started: bool,
    stdout_open: bool,
}

/// FastCGI server endpoint filter: multiplexed requests on one transport,
/// one sub-pipeline (child layout 0) per request id. Responses are packed
/// into STDOUT records closed by END_REQUEST.
pub struct Server {
    deframer: Deframer,
    records: RecordDecoder,
    requests: HashMap<u16, ServerRequest>,
}

impl Server {
    pub fn new() -> Server {
        Server {
            deframer: new_record_deframer(),
            records: RecordDecoder::new(),
            requests: HashMap::new(),
        }
    }

    fn on_record(&mut self, record: Record, ctx: &mut FilterCtx, out: &mut dyn FnMut(Event)) {
        let id = record.request_id;
        match record.rtype {
            record_type::BEGIN_REQUEST => {
                if self.requests.contains_key(&id) || record.body.len() < 8 {
                    return;
                }
                let mut body = record.body;
                let mut first = Data::new();
                body.shift_to(8, &mut first);
                let mut buf = [0u8; 8];
                first.to_bytes(&mut buf);
                self.requests.insert(
                    id,
                    ServerRequest {
                        pipeline: ctx.sub_pipeline(0),
                        role: BigEndian::read_u16(&buf[0..2]),
                        keep_alive: buf[2] & FLAG_KEEP_CONN != 0,
                        params_buffer: Data::new(),
                        started: false,
                        stdout_open: false,
                    },
                );
            }
            record_type::ABORT_REQUEST => {
                if let Some(mut req) = self.requests.remove(&id) {
                    req.pipeline
                        .input(Event::stream_end(Some(ErrorKind::ConnectionCanceled)), &mut |_| {});
                }
            }
            record_type::PARAMS => {
                let empty = record.body.is_empty();
                let mut events = Vec::new();
                if let Some(req) = self.requests.get_mut(&id) {
                    if !empty {
                        req.params_buffer.push(record.body);
                    } else if !req.started {
                        req.started = true;
                        let params =
                            decode_params(&req.params_buffer).unwrap_or_default();
                        let head = FcgiRequestHead {
                            role: req.role,
                            keep_alive: req.keep_alive,
                            params,
                        };
                        req.pipeline.input(
                            Event::message_start(Some(MessageHead::Fcgi(head))),
                            &mut |e| events.push(e),
                        );
                    }
                }
                self.respond(id, events, out);
            }
            record_type::STDIN | record_type::DATA => {
                let empty = record.body.is_empty();
                let mut events = Vec::new();
                if let Some(req) = self.requests.get_mut(&id) {
                    if !req.started {
                        return;
                    }
                    if !empty {
                        req.pipeline
                            .input(Event::Data(record.body), &mut |e| events.push(e));
                    } else {
                        req.pipeline
                            .input(Event::message_end(None), &mut |e| events.push(e));
                    }
                }
                self.respond(id, events, out);
            }
            _ => {}
        }
    }

    /// Serializes response events for request `id` onto the transport.
    fn respond(&mut self, id: u16, events: Vec<Event>, out: &mut dyn FnMut(Event)) {
        let mut wire = Data::new();
        let mut finished = false;
        if let Some(req) = self.requests.get_mut(&id) {
            for evt in events {
                match evt {
                    Event::MessageStart(_) => {
                        req.stdout_open = true;
                    }
                    Event::Data(data) => {
                        if req.stdout_open && !data.is_empty() {
                            write_record(&mut wire, record_type::STDOUT, id, data);
                        }
                    }
                    Event::MessageEnd(end) => {
                        if req.stdout_open {
                            req.stdout_open = false;
                            finished = true;
                            write_record(&mut wire, record_type::STDOUT, id, Data::new());
                            let (app_status, protocol_status) = match end.tail {
                                Some(MessageTail::Fcgi(t)) => (t.app_status, t.protocol_status),
                                _ => (0, STATUS_REQUEST_COMPLETE),
                            };
                            let mut body = Data::new();
                            let mut buf = [0u8; 8];
                            BigEndian::write_u32(&mut buf[0..4], app_status);
                            buf[4] = protocol_status;
                            body.push_slice(&buf);
                            write_record(&mut wire, record_type::END_REQUEST, id, body);
                        }
                    }
                    Event::StreamEnd(_) => {}
                }
            }
        }
        if finished {
            self.requests.remove(&id);
        }
        if !wire.is_empty() {
            out(Event::Data(wire));
        }
    }
}

impl Filter for Server {
    fn process(&mut self, ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::Data(mut data) => {
                self.deframer.deframe(&mut self.records, &mut data, out);
                for record in std::mem::take(&mut self.records.records) {
                    self.on_record(record, ctx, out);
                }
            }
            Event::StreamEnd(eos) => {
                for (_, mut req) in self.requests.drain() {
                    req.pipeline.input(Event::stream_end(None), &mut |_| {});
                }
                out(Event::StreamEnd(eos));
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.deframer = new_record_deframer();
        self.records = RecordDecoder::new();
        self.requests.clear();
    }
}

// ---- client ----

struct ClientRequest {
    started: bool,
    ended: bool,
    response_started: bool,
    response_ended: bool,
    stderr: Vec<u8>,
    output: Vec<Event>,
}

/// FastCGI client endpoint: many request ids multiplexed onto one transport
/// connection.
pub struct Client {
    deframer: Deframer,
    records: RecordDecoder,
    requests: HashMap<u16, ClientRequest>,
    next_id: u16,
}

impl Client {
    pub fn new() -> Client {
        Client {
            deframer: new_record_deframer(),
            records: RecordDecoder::new(),
            requests: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn open_request(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.requests.insert(
            id,
            ClientRequest {
                started: false,
                ended: false,
                response_started: false,
                response_ended: false,
                stderr: Vec::new(),
                output: Vec::new(),
            },
        );
        id
    }

    pub fn close_request(&mut self, id: u16) {
        self.requests.remove(&id);
    }

    /// Feeds one request event for `id`; wire bytes flush to `out`.
    pub fn request_input(&mut self, id: u16, evt: Event, out: &mut dyn FnMut(Event)) {
        let mut wire = Data::new();
        let req = match self.requests.get_mut(&id) {
            Some(r) => r,
            None => return,
        };
        match evt {
            Event::MessageStart(start) => {
                if req.started {
                    return;
                }
                req.started = true;
                let head = match start.head {
                    Some(MessageHead::Fcgi(h)) => h,
                    _ => FcgiRequestHead {
                        role: ROLE_RESPONDER,
                        keep_alive: true,
                        params: Vec::new(),
                    },
                };
                let mut body = Data::new();
                let mut buf = [0u8; 8];
                BigEndian::write_u16(&mut buf[0..2], head.role);
                buf[2] = if head.keep_alive { FLAG_KEEP_CONN } else { 0 };
                body.push_slice(&buf);
                write_record(&mut wire, record_type::BEGIN_REQUEST, id, body);

                // PARAMS records cap at the 16-bit record length.
                let encoded = encode_params(&head.params);
                let mut rest = encoded;
                while rest.len() > 0xfff8 {
                    let mut piece = Data::new();
                    rest.shift_to(0xfff8, &mut piece);
                    write_record(&mut wire, record_type::PARAMS, id, piece);
                }
                if !rest.is_empty() {
                    write_record(&mut wire, record_type::PARAMS, id, rest);
                }
                write_record(&mut wire, record_type::PARAMS, id, Data::new());
            }
            Event::Data(data) => {
                if req.started && !req.ended && !data.is_empty() {
                    write_record(&mut wire, record_type::STDIN, id, data);
                }
            }
            Event::MessageEnd(_) | Event::StreamEnd(_) => {
                if req.started && !req.ended {
                    req.ended = true;
                    write_record(&mut wire, record_type::STDIN, id, Data::new());
                }
            }
        }
        if !wire.is_empty() {
            out(Event::Data(wire));
        }
    }

    /// Feeds transport bytes from the responder side.
    pub fn process_reply(&mut self, evt: Event) {
        if let Event::Data(mut data) = evt {
            self.deframer.deframe(&mut self.records, &mut data, &mut |_| {});
            for record in std::mem::take(&mut self.records.records) {
                self.on_record(record);
            }
        }
    }

    fn on_record(&mut self, record: Record) {
        let req = match self.requests.get_mut(&record.request_id) {
            Some(r) => r,
            None => return,
        };
        match record.rtype {
            record_type::STDOUT => {
                if !req.response_started {
                    req.response_started = true;
                    req.output.push(Event::message_start(None));
                }
                if !record.body.is_empty() && !req.response_ended {
                    req.output.push(Event::Data(record.body));
                }
            }
            record_type::STDERR => {
                if !record.body.is_empty() {
                    req.stderr.extend_from_slice(&record.body.to_vec());
                }
            }
            record_type::END_REQUEST => {
                if !req.response_started {
                    req.response_started = true;
                    req.output.push(Event::message_start(None));
                }
                if !req.response_ended && record.body.len() >= 8 {
                    req.response_ended = true;
                    let mut buf = [0u8; 8];
                    let mut body = record.body;
                    let mut first = Data::new();
                    body.shift_to(8, &mut first);
                    first.to_bytes(&mut buf);
                    let tail = FcgiResponseTail {
                        app_status: BigEndian::read_u32(&buf[0..4]),
                        protocol_status: buf[4],
                        stderr: std::mem::take(&mut req.stderr),
                    };
                    req.output
                        .push(Event::message_end(Some(MessageTail::Fcgi(tail))));
                }
            }
            _ => {}
        }
    }

    /// Drains buffered response events for `id`.
    pub fn drain(&mut self, id: u16, out: &mut dyn FnMut(Event)) {
        if let Some(req) = self.requests.get_mut(&id) {
            for evt in req.output.drain(..) {
                out(evt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineLayout;

    #[test]
    fn test_params_pair_length_escape() {
        let long_value = "v".repeat(300);
        let params = vec![
            ("SHORT".to_string(), "x".to_string()),
            ("LONG".to_string(), long_value.clone()),
        ];
        let encoded = encode_params(&params);
        let decoded = decode_params(&encoded).unwrap();
        assert_eq!(decoded, params);

        // The long value's length prefix uses the 4-byte high-bit form.
        let bytes = encoded.to_vec();
        let idx = 1 + 1 + 5 + 1; // SHORT pair: klen vlen key value, then LONG klen
        assert_eq!(bytes[idx + 1] & 0x80, 0x80);
    }

    #[test]
    fn test_record_padding_to_eight_bytes() {
        let mut wire = Data::new();
        write_record(&mut wire, record_type::STDIN, 1, Data::from_slice(b"abc"));
        // 8-byte header + 3 content + 5 padding.
        assert_eq!(wire.len(), 16);
        let bytes = wire.to_vec();
        assert_eq!(BigEndian::read_u16(&bytes[4..6]), 3);
        assert_eq!(bytes[6], 5);
    }

    /// Sub-pipeline handler: echoes the stdin body back, reporting the
    /// request's param count in the app status.
    struct Handler {
        body: Data,
        params: usize,
    }

    impl Filter for Handler {
        fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
            match evt {
                Event::MessageStart(start) => {
                    if let Some(MessageHead::Fcgi(h)) = &start.head {
                        self.params = h.params.len();
                    }
                }
                Event::Data(d) => self.body.push(d),
                Event::MessageEnd(_) => {
                    out(Event::message_start(None));
                    out(Event::Data(self.body.take_all()));
                    let tail = FcgiResponseTail {
                        app_status: self.params as u32,
                        protocol_status: STATUS_REQUEST_COMPLETE,
                        stderr: Vec::new(),
                    };
                    out(Event::message_end(Some(MessageTail::Fcgi(tail))));
                }
                Event::StreamEnd(_) => {}
            }
        }
    }

    fn server_ctx() -> FilterCtx {
        let child = PipelineLayout::new("app")
            .append(|| Handler {
                body: Data::new(),
                params: 0,
            })
            .shared();
        let layout = PipelineLayout::new("fcgi").child(child).shared();
        FilterCtx::with_layout(None, layout)
    }

    #[test]
    fn test_request_response_round_trip() {
        let mut client = Client::new();
        let mut server = Server::new();
        let mut ctx = server_ctx();

        let id = client.open_request();
        let head = FcgiRequestHead {
            role: ROLE_RESPONDER,
            keep_alive: true,
            params: vec![
                ("SCRIPT_NAME".to_string(), "/index.php".to_string()),
                ("QUERY_STRING".to_string(), "a=1".to_string()),
            ],
        };

        let mut to_server = Vec::new();
        client.request_input(
            id,
            Event::message_start(Some(MessageHead::Fcgi(head))),
            &mut |e| to_server.push(e),
        );
        client.request_input(id, Event::Data(Data::from_str("stdin!")), &mut |e| {
            to_server.push(e)
        });
        client.request_input(id, Event::message_end(None), &mut |e| to_server.push(e));

        let mut to_client = Vec::new();
        for evt in to_server {
            server.process(&mut ctx, evt, &mut |e| to_client.push(e));
        }
        for evt in to_client {
            client.process_reply(evt);
        }

        let mut got = Vec::new();
        client.drain(id, &mut |e| got.push(e));
        assert!(matches!(got[0], Event::MessageStart(_)));
        let body: Vec<u8> = got
            .iter()
            .filter_map(|e| match e {
                Event::Data(d) => Some(d.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"stdin!");
        match got.last() {
            Some(Event::MessageEnd(end)) => match &end.tail {
                Some(MessageTail::Fcgi(t)) => {
                    assert_eq!(t.app_status, 2); // two params seen
                    assert_eq!(t.protocol_status, STATUS_REQUEST_COMPLETE);
                }
                other => panic!("missing fcgi tail: {:?}", other),
            },
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_multiplexed_request_ids() {
        let mut client = Client::new();
        let mut server = Server::new();
        let mut ctx = server_ctx();

        let a = client.open_request();
        let b = client.open_request();
        assert_ne!(a, b);

        // Interleave: both BEGIN+PARAMS first, then stdin ends in reverse.
        let mut wire = Vec::new();
        for id in [a, b] {
            client.request_input(
                id,
                Event::message_start(Some(MessageHead::Fcgi(FcgiRequestHead {
                    role: ROLE_RESPONDER,
                    keep_alive: true,
                    params: vec![("ID".to_string(), id.to_string())],
                }))),
                &mut |e| wire.push(e),
            );
        }
        for id in [b, a] {
            client.request_input(id, Event::Data(Data::from_str(&format!("body{}", id))), &mut |e| {
                wire.push(e)
            });
            client.request_input(id, Event::message_end(None), &mut |e| wire.push(e));
        }

        let mut replies = Vec::new();
        for evt in wire {
            server.process(&mut ctx, evt, &mut |e| replies.push(e));
        }
        for evt in replies {
            client.process_reply(evt);
        }

        for id in [a, b] {
            let mut body = Vec::new();
            client.drain(id, &mut |e| {
                if let Event::Data(d) = e {
                    body.extend_from_slice(&d.to_vec());
                }
            });
            assert_eq!(body, format!("body{}", id).into_bytes());
        }
    }

    #[test]
    fn test_stderr_collected_into_tail() {
        let mut client = Client::new();
        let id = client.open_request();
        client.request_input(id, Event::message_start(None), &mut |_| {});

        let mut wire = Data::new();
        write_record(&mut wire, record_type::STDERR, id, Data::from_str("oops"));
        write_record(&mut wire, record_type::STDOUT, id, Data::from_str("ok"));
        let mut end_body = Data::new();
        end_body.push_slice(&[0, 0, 0, 7, STATUS_REQUEST_COMPLETE, 0, 0, 0]);
        write_record(&mut wire, record_type::END_REQUEST, id, end_body);
        client.process_reply(Event::Data(wire));

        let mut got = Vec::new();
        client.drain(id, &mut |e| got.push(e));
        match got.last() {
            Some(Event::MessageEnd(end)) => match &end.tail {
                Some(MessageTail::Fcgi(t)) => {
                    assert_eq!(t.app_status, 7);
                    assert_eq!(t.stderr, b"oops");
                }
                other => panic!("missing tail: {:?}", other),
            },
            other => panic!("unexpected event {:?}", other),
        }
    }
}
