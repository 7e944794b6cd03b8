//! HTTP/2 endpoint: a concurrent multi-stream codec layered on the deframer
//! and the stream machinery. The server side opens one sub-pipeline per
//! stream (child layout 0); the client side hands out stream handles with
//! odd ids.

pub mod frame;
pub mod hpack;

use std::collections::VecDeque;

use crate::buffer::EventBuffer;
use crate::config::Http2Options;
use crate::data::Data;
use crate::deframer::Deframer;
use crate::event::{ErrorKind, Event, MessageHead, MessageTail};
use crate::pipeline::{Filter, FilterCtx, Pipeline};
use crate::scarce::ScarceArray;

use frame::{
    frame_type, ErrorCode, Frame, FrameDecoder, FrameEncoder, Settings, BIT_ACK, BIT_END_HEADERS,
    BIT_END_STREAM,
};
use hpack::{HeaderBlock, HeaderDecoder, HeaderEncoder};

const MAX_HEADER_FRAME_SIZE: usize = 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Connection-wide mutable state shared between the endpoint and its
/// streams, split out so a stream and the connection can be borrowed
/// together.
struct Conn {
    is_server: bool,
    settings: Settings,
    peer_settings: Settings,
    output: Data,
    send_window: i64,
    recv_window: i64,
    recv_window_max: i64,
    has_sent_preface: bool,
    has_gone_away: bool,
    last_received_stream_id: u32,
}

impl Conn {
    /// Appends one frame to the output buffer, emitting the preface and our
    /// SETTINGS first if they have not gone out yet.
    fn frame(&mut self, frm: Frame) {
        if self.has_gone_away {
            return;
        }
        if !self.has_sent_preface {
            self.has_sent_preface = true;
            if !self.is_server {
                self.output.push_slice(frame::PREFACE);
            }
            let mut settings = Frame::new(0, frame_type::SETTINGS, 0);
            settings.payload.push_slice(&self.settings.encode());
            FrameEncoder::frame(settings, &mut self.output);
        }
        FrameEncoder::frame(frm, &mut self.output);
    }

    fn goaway(&mut self, err: ErrorCode) {
        FrameEncoder::goaway(self.last_received_stream_id, err, &mut self.output);
        self.has_gone_away = true;
    }
}

enum StreamRole {
    /// Request events feed a per-stream sub-pipeline; its outputs become the
    /// response.
    Server(Pipeline),
    /// Response events buffer for the owning stream handle.
    Client(EventBuffer),
}

enum Failure {
    Stream(ErrorCode),
    Connection(ErrorCode),
}

struct Stream {
    id: u32,
    state: StreamState,
    role: StreamRole,
    send_buffer: Data,
    tail_buffer: Data,
    send_window: i64,
    recv_window: i64,
    recv_window_max: i64,
    end_headers: bool,
    end_stream_recv: bool,
    end_stream_send: bool,
    end_input: bool,
    end_output: bool,
    message_started: bool,
    message_ended: bool,
    is_tunnel: bool,
    is_pending: bool,
    recv_payload: usize,
    expected_length: Option<usize>,
    trailers: Option<crate::event::Headers>,
}

impl Stream {
    fn new(id: u32, role: StreamRole, send_window: i64, recv_window: i64) -> Stream {
        Stream {
            id,
            state: StreamState::Idle,
            role,
            send_buffer: Data::new(),
            tail_buffer: Data::new(),
            send_window,
            recv_window,
            recv_window_max: recv_window,
            end_headers: false,
            end_stream_recv: false,
            end_stream_send: false,
            end_input: false,
            end_output: false,
            message_started: false,
            message_ended: false,
            is_tunnel: false,
            is_pending: false,
            recv_payload: 0,
            expected_length: None,
            trailers: None,
        }
    }

    fn done(&self) -> bool {
        let delivered = match &self.role {
            StreamRole::Client(buf) => buf.is_empty(),
            StreamRole::Server(_) => true,
        };
        self.end_input
            && self.end_output
            && self.send_buffer.is_empty()
            && self.tail_buffer.is_empty()
            && delivered
    }

    /// One event from the application side of this stream, encoded into
    /// frames on `conn`.
    fn write(&mut self, conn: &mut Conn, evt: Event) {
        match evt {
            Event::MessageStart(start) => {
                if self.message_started {
                    return;
                }
                self.message_started = true;
                let mut block = Data::new();
                if let Some(head) = &start.head {
                    if !conn.is_server {
                        if let MessageHead::Request(h) = head {
                            if h.method == "CONNECT" {
                                self.is_tunnel = true;
                            }
                        }
                    }
                    HeaderEncoder::encode(false, head, &mut block);
                } else if conn.is_server {
                    HeaderEncoder::encode(
                        false,
                        &MessageHead::Response(Default::default()),
                        &mut block,
                    );
                } else {
                    HeaderEncoder::encode(
                        false,
                        &MessageHead::Request(Default::default()),
                        &mut block,
                    );
                }
                self.write_header_block(conn, block);
                self.state = match self.state {
                    StreamState::Idle => StreamState::Open,
                    StreamState::ReservedLocal => StreamState::HalfClosedRemote,
                    s => s,
                };
            }
            Event::Data(data) => {
                if !self.message_started || data.is_empty() {
                    return;
                }
                if self.state == StreamState::Open || self.state == StreamState::HalfClosedRemote {
                    self.send_buffer.push(data);
                    self.pump(conn);
                }
            }
            Event::MessageEnd(end) => {
                if self.is_tunnel || !self.message_started || self.message_ended {
                    return;
                }
                if let Some(MessageTail::Http(trailers)) = end.tail {
                    let mut block = Data::new();
                    HeaderEncoder::encode_trailers(&trailers, &mut block);
                    self.tail_buffer = block;
                }
                self.message_ended = true;
                self.end_stream_send = true;
                self.state = match self.state {
                    StreamState::Open => StreamState::HalfClosedLocal,
                    StreamState::HalfClosedRemote => StreamState::Closed,
                    s => s,
                };
                self.pump(conn);
                self.end_output = true;
            }
            Event::StreamEnd(_) => {
                if self.message_started && !self.message_ended {
                    self.message_ended = true;
                    self.end_stream_send = true;
                    self.pump(conn);
                }
                self.end_output = true;
            }
        }
    }

    fn write_header_block(&mut self, conn: &mut Conn, mut block: Data) {
        let mut ftype = frame_type::HEADERS;
        loop {
            let len = block.len().min(MAX_HEADER_FRAME_SIZE);
            let mut frm = Frame::new(self.id, ftype, 0);
            block.shift_to(len, &mut frm.payload);
            if block.is_empty() {
                frm.flags |= BIT_END_HEADERS;
            }
            if self.end_stream_send && self.send_buffer.is_empty() && self.tail_buffer.is_empty() {
                if ftype == frame_type::HEADERS {
                    frm.flags |= BIT_END_STREAM;
                    self.end_stream_send = false;
                }
            }
            conn.frame(frm);
            if block.is_empty() {
                break;
            }
            ftype = frame_type::CONTINUATION;
        }
    }

    /// Drains the send buffer into DATA frames as far as both the stream and
    /// connection windows allow. Blocked streams park on the pending list.
    fn pump(&mut self, conn: &mut Conn) {
        let is_empty_end =
            self.end_stream_send && self.send_buffer.is_empty() && self.tail_buffer.is_empty();
        let mut size = self.send_buffer.len() as i64;
        if size > self.send_window {
            size = self.send_window.max(0);
        }
        if size > conn.send_window {
            size = conn.send_window.max(0);
        }
        if size > 0 || is_empty_end {
            let mut remain = size;
            loop {
                let n = (remain as usize).min(conn.peer_settings.max_frame_size as usize);
                remain -= n as i64;
                let mut frm = Frame::new(self.id, frame_type::DATA, 0);
                if n > 0 {
                    self.send_buffer.shift_to(n, &mut frm.payload);
                }
                if self.end_stream_send
                    && self.send_buffer.is_empty()
                    && self.tail_buffer.is_empty()
                {
                    frm.flags = BIT_END_STREAM;
                    self.end_stream_send = false;
                }
                conn.frame(frm);
                if remain <= 0 {
                    break;
                }
            }
            self.send_window -= size;
            conn.send_window -= size;
        }
        if self.send_buffer.is_empty() {
            if !self.tail_buffer.is_empty() {
                let block = self.tail_buffer.take_all();
                self.write_header_block(conn, block);
            }
            self.is_pending = false;
        } else {
            self.is_pending = true;
        }
    }

    /// One frame addressed to this stream. Returns the events to deliver to
    /// the stream's consumer.
    fn on_frame(
        &mut self,
        conn: &mut Conn,
        decoder: &mut HeaderDecoder,
        mut frm: Frame,
        header_block: &mut Option<u32>,
    ) -> Result<Vec<Event>, Failure> {
        let mut events = Vec::new();
        match frm.frame_type {
            frame_type::DATA => {
                if self.state != StreamState::Open && self.state != StreamState::HalfClosedLocal {
                    return Err(Failure::Stream(ErrorCode::StreamClosed));
                }
                if frm.is_padded() {
                    Self::strip_padding(&mut frm)?;
                }
                let size = frm.payload.len();
                let is_end_stream = frm.is_end_stream();
                if size > 0 {
                    self.deduct_recv(conn, size as i64)?;
                    self.recv_payload += size;
                    events.push(Event::Data(frm.payload));
                }
                if is_end_stream {
                    self.recv_closed(conn, &mut events)?;
                }
            }
            frame_type::HEADERS => {
                if self.end_headers && !frm.is_end_stream() {
                    return Err(Failure::Stream(ErrorCode::ProtocolError));
                }
                match self.state {
                    StreamState::Idle
                    | StreamState::ReservedRemote
                    | StreamState::Open
                    | StreamState::HalfClosedLocal => {}
                    _ => return Err(Failure::Stream(ErrorCode::StreamClosed)),
                }
                if frm.is_padded() {
                    Self::strip_padding(&mut frm)?;
                }
                if frm.is_priority() {
                    self.strip_priority(&mut frm)?;
                }
                if frm.is_end_stream() {
                    self.end_stream_recv = true;
                }
                decoder.start(!conn.is_server, self.end_headers);
                *header_block = Some(self.id);
                self.parse_headers(conn, decoder, frm, header_block, &mut events)?;
            }
            frame_type::CONTINUATION => {
                self.parse_headers(conn, decoder, frm, header_block, &mut events)?;
            }
            frame_type::PRIORITY => {
                self.strip_priority(&mut frm)?;
            }
            frame_type::RST_STREAM => {
                if self.state == StreamState::Idle {
                    return Err(Failure::Connection(ErrorCode::ProtocolError));
                }
                self.state = StreamState::Closed;
                events.push(Event::stream_end(Some(ErrorKind::ConnectionReset)));
                self.end_input = true;
                self.end_output = true;
            }
            frame_type::PUSH_PROMISE => {
                if conn.is_server {
                    return Err(Failure::Connection(ErrorCode::ProtocolError));
                }
            }
            frame_type::WINDOW_UPDATE => {
                let inc = frm
                    .decode_window_update()
                    .map_err(Failure::Connection)? as i64;
                if inc == 0 {
                    return Err(Failure::Stream(ErrorCode::ProtocolError));
                }
                if self.send_window > 0 && self.send_window + inc > 0x7fff_ffff {
                    return Err(Failure::Stream(ErrorCode::FlowControlError));
                }
                self.send_window += inc;
                self.pump(conn);
            }
            _ => {}
        }
        Ok(events)
    }

    fn parse_headers(
        &mut self,
        conn: &mut Conn,
        decoder: &mut HeaderDecoder,
        frm: Frame,
        header_block: &mut Option<u32>,
        events: &mut Vec<Event>,
    ) -> Result<(), Failure> {
        if decoder.decode(&frm.payload).is_err() {
            return Err(Failure::Connection(ErrorCode::CompressionError));
        }
        if !frm.is_end_headers() {
            return Ok(());
        }
        *header_block = None;
        let block = decoder
            .end()
            .map_err(|err| Failure::Connection(err))?;

        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        } else if self.state == StreamState::ReservedRemote {
            self.state = StreamState::HalfClosedLocal;
        }

        match block {
            HeaderBlock::Head(head) => {
                self.end_headers = true;
                self.expected_length = decoder.content_length();
                if conn.is_server {
                    if let MessageHead::Request(h) = &head {
                        if h.method == "CONNECT" {
                            self.is_tunnel = true;
                        }
                    }
                }
                events.push(Event::message_start(Some(head)));
                if self.is_tunnel {
                    events.push(Event::message_end(None));
                }
            }
            HeaderBlock::Trailers(trailers) => {
                self.trailers = Some(trailers);
            }
        }

        if self.end_stream_recv {
            self.recv_closed(conn, events)?;
        }
        Ok(())
    }

    fn recv_closed(&mut self, _conn: &mut Conn, events: &mut Vec<Event>) -> Result<(), Failure> {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            s => s,
        };
        if let Some(expected) = self.expected_length {
            if expected != self.recv_payload {
                return Err(Failure::Connection(ErrorCode::ProtocolError));
            }
        }
        if self.is_tunnel {
            events.push(Event::stream_end(None));
        } else {
            let tail = self.trailers.take().map(MessageTail::Http);
            events.push(Event::message_end(tail));
            events.push(Event::stream_end(None));
        }
        self.end_input = true;
        Ok(())
    }

    fn deduct_recv(&mut self, conn: &mut Conn, size: i64) -> Result<(), Failure> {
        if size > self.recv_window || size > conn.recv_window {
            return Err(Failure::Connection(ErrorCode::FlowControlError));
        }
        self.recv_window -= size;
        conn.recv_window -= size;
        Ok(())
    }

    fn strip_padding(frm: &mut Frame) -> Result<(), Failure> {
        let mut pad = Data::new();
        frm.payload.shift_to(1, &mut pad);
        let pad_length = pad.to_vec().first().copied().unwrap_or(0) as usize;
        if pad_length >= frm.payload.len() {
            return Err(Failure::Connection(ErrorCode::ProtocolError));
        }
        frm.payload.pop(pad_length);
        Ok(())
    }

    fn strip_priority(&self, frm: &mut Frame) -> Result<(), Failure> {
        if frm.payload.len() < 5 {
            return Err(Failure::Connection(ErrorCode::ProtocolError));
        }
        let mut buf = Data::new();
        frm.payload.shift_to(5, &mut buf);
        let bytes = buf.to_vec();
        let dependency = (((bytes[0] as u32) << 24)
            | ((bytes[1] as u32) << 16)
            | ((bytes[2] as u32) << 8)
            | bytes[3] as u32)
            & 0x7fff_ffff;
        if dependency == self.id {
            return Err(Failure::Connection(ErrorCode::ProtocolError));
        }
        Ok(())
    }
}

/// Shared endpoint machinery for both roles.
struct Endpoint {
    conn: Conn,
    deframer: Deframer,
    frames: FrameDecoder,
    decoder: HeaderDecoder,
    streams: ScarceArray<Stream>,
    pending: VecDeque<u32>,
    header_block: Option<u32>,
    ended: bool,
}

impl Endpoint {
    fn new(is_server: bool, options: &Http2Options) -> Endpoint {
        let mut settings = Settings::default();
        settings.enable_push = false;
        settings.initial_window_size = options.stream_window_size as u32;
        settings.max_frame_size = options.max_frame_size as u32;
        if options.max_concurrent_streams > 0 {
            settings.max_concurrent_streams = Some(options.max_concurrent_streams as u32);
        }
        if options.max_header_list_size > 0 {
            settings.max_header_list_size = Some(options.max_header_list_size as u32);
        }
        let mut frames = FrameDecoder::new(is_server);
        frames.max_frame_size = settings.max_frame_size;
        let mut deframer = Deframer::new(frames.initial_state());
        {
            let f = &frames;
            deframer.arm(|cmd| f.arm(cmd));
        }
        let table_size = settings.header_table_size as usize;
        Endpoint {
            conn: Conn {
                is_server,
                settings,
                peer_settings: Settings::default(),
                output: Data::new(),
                send_window: 0xffff,
                recv_window: options.connection_window_size as i64,
                recv_window_max: options.connection_window_size as i64,
                has_sent_preface: false,
                has_gone_away: false,
                last_received_stream_id: 0,
            },
            deframer,
            frames,
            decoder: HeaderDecoder::new(table_size),
            streams: ScarceArray::new(),
            pending: VecDeque::new(),
            header_block: None,
            ended: false,
        }
    }

    fn open_stream(&mut self, id: u32, role: StreamRole) {
        let stream = Stream::new(
            id,
            role,
            self.conn.peer_settings.initial_window_size as i64,
            self.conn.settings.initial_window_size as i64,
        );
        self.streams.set(id, stream);
    }

    /// Routes one decoded frame; returns per-stream events to deliver.
    fn on_frame(
        &mut self,
        frm: Frame,
        new_stream: &mut dyn FnMut() -> StreamRole,
    ) -> Vec<(u32, Vec<Event>)> {
        let mut delivered = Vec::new();
        if self.conn.has_gone_away {
            return delivered;
        }
        if let Some(id) = self.header_block {
            if frm.frame_type != frame_type::CONTINUATION || frm.stream_id != id {
                self.connection_error(ErrorCode::ProtocolError);
                return delivered;
            }
        }
        if frm.stream_id == 0 {
            self.on_connection_frame(frm);
            return delivered;
        }
        let id = frm.stream_id;
        if self.streams.get(id).is_none() {
            if id <= self.conn.last_received_stream_id {
                match frm.frame_type {
                    frame_type::PRIORITY
                    | frame_type::RST_STREAM
                    | frame_type::WINDOW_UPDATE => return delivered,
                    _ => {
                        self.connection_error(ErrorCode::StreamClosed);
                        return delivered;
                    }
                }
            }
            if frm.frame_type == frame_type::DATA || frm.frame_type == frame_type::WINDOW_UPDATE {
                self.connection_error(ErrorCode::ProtocolError);
                return delivered;
            }
            if !self.conn.is_server {
                // Clients do not accept peer-initiated streams.
                return delivered;
            }
            if id % 2 == 0 {
                self.connection_error(ErrorCode::ProtocolError);
                return delivered;
            }
            self.open_stream(id, new_stream());
            if frm.frame_type != frame_type::PRIORITY {
                self.conn.last_received_stream_id = id;
            }
        }
        let conn = &mut self.conn;
        let decoder = &mut self.decoder;
        let header_block = &mut self.header_block;
        let result = self
            .streams
            .get_mut(id)
            .map(|s| s.on_frame(conn, decoder, frm, header_block));
        match result {
            Some(Ok(events)) => {
                if !events.is_empty() {
                    delivered.push((id, events));
                }
                self.after_stream_op(id);
            }
            Some(Err(Failure::Stream(err))) => self.stream_error(id, err),
            Some(Err(Failure::Connection(err))) => self.connection_error(err),
            None => {}
        }
        delivered
    }

    fn on_connection_frame(&mut self, frm: Frame) {
        match frm.frame_type {
            frame_type::SETTINGS => {
                if frm.is_ack() {
                    if !frm.payload.is_empty() {
                        self.connection_error(ErrorCode::FrameSizeError);
                    }
                    return;
                }
                let len = frm.payload.len();
                if len % 6 != 0 {
                    self.connection_error(ErrorCode::FrameSizeError);
                    return;
                }
                let bytes = frm.payload.to_vec();
                let old_window = self.conn.peer_settings.initial_window_size as i64;
                match self.conn.peer_settings.decode(&bytes) {
                    Ok(()) => {
                        let delta = self.conn.peer_settings.initial_window_size as i64 - old_window;
                        if delta != 0 {
                            let keys = self.streams.keys();
                            for id in keys {
                                if let Some(s) = self.streams.get_mut(id) {
                                    s.send_window += delta;
                                }
                            }
                        }
                        let ack = Frame::new(0, frame_type::SETTINGS, BIT_ACK);
                        self.conn.frame(ack);
                        self.pump_pending();
                    }
                    Err(err) => self.connection_error(err),
                }
            }
            frame_type::PING => {
                if frm.payload.len() != 8 {
                    self.connection_error(ErrorCode::FrameSizeError);
                } else if !frm.is_ack() {
                    let mut ack = Frame::new(0, frame_type::PING, BIT_ACK);
                    ack.payload = frm.payload;
                    self.conn.frame(ack);
                }
            }
            frame_type::GOAWAY => {
                self.connection_error(ErrorCode::NoError);
            }
            frame_type::WINDOW_UPDATE => match frm.decode_window_update() {
                Ok(0) => self.connection_error(ErrorCode::ProtocolError),
                Ok(inc) => {
                    let n = self.conn.send_window + inc as i64;
                    if n > 0x7fff_ffff {
                        self.connection_error(ErrorCode::FlowControlError);
                    } else {
                        self.conn.send_window = n;
                        self.pump_pending();
                    }
                }
                Err(err) => self.connection_error(err),
            },
            _ => self.connection_error(ErrorCode::ProtocolError),
        }
    }

    /// Resumes streams parked on the pending list, in order.
    fn pump_pending(&mut self) {
        let parked: Vec<u32> = self.pending.drain(..).collect();
        for id in parked {
            let conn = &mut self.conn;
            if let Some(s) = self.streams.get_mut(id) {
                s.pump(conn);
            }
            self.after_stream_op(id);
        }
    }

    fn after_stream_op(&mut self, id: u32) {
        let (is_pending, done) = match self.streams.get(id) {
            Some(s) => (s.is_pending, s.done()),
            None => return,
        };
        let queued = self.pending.contains(&id);
        if is_pending && !queued {
            self.pending.push_back(id);
        } else if !is_pending && queued {
            self.pending.retain(|x| *x != id);
        }
        if done {
            self.streams.remove(id);
            self.pending.retain(|x| *x != id);
        }
    }

    fn stream_error(&mut self, id: u32, err: ErrorCode) {
        self.streams.remove(id);
        self.pending.retain(|x| *x != id);
        FrameEncoder::rst_stream(id, err, &mut self.conn.output);
    }

    fn connection_error(&mut self, err: ErrorCode) {
        self.conn.goaway(err);
    }

    /// Refills the connection and per-stream receive windows once they fall
    /// below half their configured maxima.
    fn send_window_updates(&mut self) {
        if self.conn.has_gone_away {
            return;
        }
        if self.conn.recv_window < self.conn.recv_window_max / 2 {
            let delta = self.conn.recv_window_max - self.conn.recv_window;
            let frm = Frame::encode_window_update(delta as u32, 0);
            self.conn.frame(frm);
            self.conn.recv_window = self.conn.recv_window_max;
        }
        let keys = self.streams.keys();
        for id in keys {
            let conn = &mut self.conn;
            if let Some(s) = self.streams.get_mut(id) {
                if s.recv_window < s.recv_window_max / 2 {
                    let delta = s.recv_window_max - s.recv_window;
                    let frm = Frame::encode_window_update(delta as u32, id);
                    conn.frame(frm);
                    s.recv_window = s.recv_window_max;
                }
            }
        }
    }

    /// Packs the output buffer into one `Data` event.
    fn flush(&mut self, out: &mut dyn FnMut(Event)) {
        if !self.conn.output.is_empty() {
            out(Event::Data(self.conn.output.take_all()));
        }
    }

    fn deframe(&mut self, mut data: Data) -> Vec<Frame> {
        self.deframer
            .deframe(&mut self.frames, &mut data, &mut |_| {});
        if let Some(err) = self.frames.error.take() {
            self.connection_error(err);
        }
        std::mem::take(&mut self.frames.frames)
    }

    fn end_all(&mut self) -> Vec<(u32, Vec<Event>)> {
        let mut delivered = Vec::new();
        self.conn.has_gone_away = true;
        for id in self.streams.keys() {
            delivered.push((id, vec![Event::stream_end(None)]));
        }
        delivered
    }
}

/// Server endpoint filter: transport bytes in, transport bytes out, one
/// sub-pipeline per request stream.
pub struct Http2Server {
    ep: Endpoint,
    options: Http2Options,
}

impl Http2Server {
    pub fn new(options: Http2Options) -> Http2Server {
        Http2Server {
            ep: Endpoint::new(true, &options),
            options,
        }
    }

    /// Requests a graceful shutdown: GOAWAY once all streams complete.
    pub fn go_away(&mut self, out: &mut dyn FnMut(Event)) {
        self.ep.connection_error(ErrorCode::NoError);
        self.ep.flush(out);
    }

    fn deliver(&mut self, id: u32, events: Vec<Event>) {
        for evt in events {
            let mut replies = Vec::new();
            match self.ep.streams.get_mut(id).map(|s| &mut s.role) {
                Some(StreamRole::Server(p)) => {
                    p.input(evt, &mut |e| replies.push(e));
                }
                _ => return,
            }
            for e in replies {
                let conn = &mut self.ep.conn;
                if let Some(s) = self.ep.streams.get_mut(id) {
                    s.write(conn, e);
                }
                self.ep.after_stream_op(id);
            }
        }
    }
}

impl Filter for Http2Server {
    fn process(&mut self, ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::Data(data) => {
                if self.ep.ended {
                    return;
                }
                let frames = self.ep.deframe(data);
                for frm in frames {
                    let delivered = {
                        let ctx_ref = &mut *ctx;
                        self.ep.on_frame(frm, &mut || {
                            StreamRole::Server(ctx_ref.sub_pipeline(0))
                        })
                    };
                    for (id, events) in delivered {
                        self.deliver(id, events);
                    }
                }
                self.ep.send_window_updates();
                self.ep.flush(out);
                if self.ep.conn.has_gone_away {
                    out(Event::stream_end(None));
                    self.ep.ended = true;
                }
            }
            Event::StreamEnd(eos) => {
                if self.ep.ended {
                    return;
                }
                for (id, events) in self.ep.end_all() {
                    self.deliver(id, events);
                }
                self.ep.ended = true;
                out(Event::StreamEnd(eos));
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.ep = Endpoint::new(true, &self.options);
    }
}

/// Client endpoint: stream handles on one side, transport bytes on the
/// other.
pub struct Http2Client {
    ep: Endpoint,
    last_sent_stream_id: u32,
}

impl Http2Client {
    pub fn new(options: Http2Options) -> Http2Client {
        Http2Client {
            ep: Endpoint::new(false, &options),
            last_sent_stream_id: 0,
        }
    }

    /// Allocates the next odd stream id.
    pub fn open_stream(&mut self) -> u32 {
        let id = self.last_sent_stream_id + if self.last_sent_stream_id == 0 { 1 } else { 2 };
        self.last_sent_stream_id = id;
        self.ep.open_stream(id, StreamRole::Client(EventBuffer::new()));
        id
    }

    /// Feeds one request event for `id`; frames flush to `out`.
    pub fn stream_input(&mut self, id: u32, evt: Event, out: &mut dyn FnMut(Event)) {
        {
            let conn = &mut self.ep.conn;
            if let Some(s) = self.ep.streams.get_mut(id) {
                s.write(conn, evt);
            }
        }
        self.ep.after_stream_op(id);
        self.ep.flush(out);
    }

    /// Feeds transport bytes from the server; reactions (ACKs, window
    /// updates) flush to `out`, response events buffer per stream.
    pub fn process_reply(&mut self, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::Data(data) => {
                let frames = self.ep.deframe(data);
                for frm in frames {
                    let delivered = self.ep.on_frame(frm, &mut || {
                        StreamRole::Client(EventBuffer::new())
                    });
                    for (id, events) in delivered {
                        if let Some(s) = self.ep.streams.get_mut(id) {
                            if let StreamRole::Client(buf) = &mut s.role {
                                for e in events {
                                    buf.push(e);
                                }
                            }
                        }
                    }
                }
                self.ep.send_window_updates();
                self.ep.flush(out);
            }
            Event::StreamEnd(_) => {
                for (id, events) in self.ep.end_all() {
                    if let Some(s) = self.ep.streams.get_mut(id) {
                        if let StreamRole::Client(buf) = &mut s.role {
                            for e in events {
                                buf.push(e);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Drains buffered response events for `id`.
    pub fn drain_stream(&mut self, id: u32, out: &mut dyn FnMut(Event)) {
        if let Some(s) = self.ep.streams.get_mut(id) {
            if let StreamRole::Client(buf) = &mut s.role {
                buf.flush(out);
            }
        }
        self.ep.after_stream_op(id);
    }

    /// Marks the local side done with `id`.
    pub fn close_stream(&mut self, id: u32) {
        if let Some(s) = self.ep.streams.get_mut(id) {
            s.end_output = true;
        }
        self.ep.after_stream_op(id);
    }
}
