//! BGP-4 message codec: the 19-byte fixed header (16 marker bytes, 2-byte
//! length, 1-byte type) and the OPEN / UPDATE / NOTIFICATION / KEEPALIVE
//! bodies, with path attributes and address prefixes.

use byteorder::{BigEndian, ByteOrder};

use crate::data::{Data, Reader};
use crate::deframer::{Deframe, Deframer, Input, ReadCmd, STATE_ERROR};
use crate::event::{ErrorKind, Event, MessageHead};
use crate::pipeline::{Filter, FilterCtx};

pub const HEADER_SIZE: usize = 19;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BgpType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
}

impl BgpType {
    fn from_code(code: u8) -> Option<BgpType> {
        Some(match code {
            1 => BgpType::Open,
            2 => BgpType::Update,
            3 => BgpType::Notification,
            4 => BgpType::Keepalive,
            _ => return None,
        })
    }
}

/// An IPv4 address prefix as carried in UPDATE NLRI fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Prefix {
    pub length: u8,
    pub addr: [u8; 4],
}

impl Prefix {
    pub fn new(addr: [u8; 4], length: u8) -> Prefix {
        Prefix { addr, length }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Origin(u8),
    /// Sequence of AS path segments; each segment is (type, as numbers).
    AsPath(Vec<(u8, Vec<u16>)>),
    NextHop([u8; 4]),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathAttribute {
    pub code: u8,
    pub optional: bool,
    pub transitive: bool,
    pub partial: bool,
    pub value: AttrValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BgpBody {
    Open {
        version: u8,
        my_as: u16,
        hold_time: u16,
        identifier: [u8; 4],
        /// Raw optional parameter bytes (capabilities et al).
        parameters: Vec<u8>,
    },
    Update {
        withdrawn: Vec<Prefix>,
        path_attributes: Vec<PathAttribute>,
        destinations: Vec<Prefix>,
    },
    Notification {
        error_code: u8,
        error_subcode: u8,
        data: Vec<u8>,
    },
    Keepalive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BgpMessage {
    pub message_type: BgpType,
    pub body: BgpBody,
}

fn read_prefix(r: &mut Reader) -> Option<Prefix> {
    let length = r.get()?;
    if length > 32 {
        return None;
    }
    let bytes = ((length as usize) + 7) / 8;
    let mut addr = [0u8; 4];
    for slot in addr.iter_mut().take(bytes) {
        *slot = r.get()?;
    }
    Some(Prefix { length, addr })
}

fn write_prefix(out: &mut Data, prefix: &Prefix) {
    out.push_u8(prefix.length);
    let bytes = ((prefix.length as usize) + 7) / 8;
    out.push_slice(&prefix.addr[..bytes]);
}

fn read_prefixes(r: &mut Reader, mut len: usize) -> Option<Vec<Prefix>> {
    let mut prefixes = Vec::new();
    while len > 0 {
        let before = r.position();
        prefixes.push(read_prefix(r)?);
        let used = r.position() - before;
        if used > len {
            return None;
        }
        len -= used;
    }
    Some(prefixes)
}

fn read_path_attribute(r: &mut Reader) -> Option<PathAttribute> {
    let flags = r.get()?;
    let code = r.get()?;
    let len = if flags & 0x10 != 0 {
        r.read_u16()? as usize
    } else {
        r.get()? as usize
    };
    let mut bytes = vec![0u8; len];
    if !r.read_exact(&mut bytes) {
        return None;
    }
    let value = match code {
        1 if len == 1 => AttrValue::Origin(bytes[0]),
        2 => {
            let mut segments = Vec::new();
            let mut i = 0;
            loop {
                if i == bytes.len() {
                    break segments_ok(segments)?;
                }
                if i + 2 > bytes.len() {
                    return None;
                }
                let seg_type = bytes[i];
                let count = bytes[i + 1] as usize;
                i += 2;
                if i + count * 2 > bytes.len() {
                    return None;
                }
                let mut asns = Vec::with_capacity(count);
                for k in 0..count {
                    asns.push(BigEndian::read_u16(&bytes[i + k * 2..]));
                }
                i += count * 2;
                segments.push((seg_type, asns));
            }
        }
        3 if len == 4 => AttrValue::NextHop([bytes[0], bytes[1], bytes[2], bytes[3]]),
        4 if len == 4 => AttrValue::MultiExitDisc(BigEndian::read_u32(&bytes)),
        5 if len == 4 => AttrValue::LocalPref(BigEndian::read_u32(&bytes)),
        6 if len == 0 => AttrValue::AtomicAggregate,
        _ => AttrValue::Raw(bytes),
    };
    Some(PathAttribute {
        code,
        optional: flags & 0x80 != 0,
        transitive: flags & 0x40 != 0,
        partial: flags & 0x20 != 0,
        value,
    })
}

fn segments_ok(segments: Vec<(u8, Vec<u16>)>) -> Option<AttrValue> {
    Some(AttrValue::AsPath(segments))
}

fn write_path_attribute(out: &mut Data, attr: &PathAttribute) {
    let mut body = Data::new();
    match &attr.value {
        AttrValue::Origin(v) => body.push_u8(*v),
        AttrValue::AsPath(segments) => {
            for (seg_type, asns) in segments {
                body.push_u8(*seg_type);
                body.push_u8(asns.len() as u8);
                for asn in asns {
                    body.push_slice(&asn.to_be_bytes());
                }
            }
        }
        AttrValue::NextHop(addr) => body.push_slice(addr),
        AttrValue::MultiExitDisc(v) | AttrValue::LocalPref(v) => {
            body.push_slice(&v.to_be_bytes())
        }
        AttrValue::AtomicAggregate => {}
        AttrValue::Raw(bytes) => body.push_slice(bytes),
    }
    let mut flags = 0u8;
    if attr.optional {
        flags |= 0x80;
    }
    if attr.transitive {
        flags |= 0x40;
    }
    if attr.partial {
        flags |= 0x20;
    }
    let extended = body.len() > 0xff;
    if extended {
        flags |= 0x10;
    }
    out.push_u8(flags);
    out.push_u8(attr.code);
    if extended {
        out.push_slice(&(body.len() as u16).to_be_bytes());
    } else {
        out.push_u8(body.len() as u8);
    }
    out.push(body);
}

fn parse_body(message_type: BgpType, body: &Data) -> Option<BgpBody> {
    let mut r = body.reader();
    match message_type {
        BgpType::Open => {
            let version = r.get()?;
            let my_as = r.read_u16()?;
            let hold_time = r.read_u16()?;
            let mut identifier = [0u8; 4];
            if !r.read_exact(&mut identifier) {
                return None;
            }
            let opt_len = r.get()? as usize;
            let mut parameters = vec![0u8; opt_len];
            if !r.read_exact(&mut parameters) {
                return None;
            }
            Some(BgpBody::Open {
                version,
                my_as,
                hold_time,
                identifier,
                parameters,
            })
        }
        BgpType::Update => {
            let withdrawn_len = r.read_u16()? as usize;
            let withdrawn = read_prefixes(&mut r, withdrawn_len)?;
            let attrs_len = r.read_u16()? as usize;
            let attrs_end = r.position() + attrs_len;
            let mut path_attributes = Vec::new();
            while r.position() < attrs_end {
                path_attributes.push(read_path_attribute(&mut r)?);
            }
            if r.position() != attrs_end {
                return None;
            }
            let remaining = r.remaining();
            let destinations = read_prefixes(&mut r, remaining)?;
            Some(BgpBody::Update {
                withdrawn,
                path_attributes,
                destinations,
            })
        }
        BgpType::Notification => {
            let error_code = r.get()?;
            let error_subcode = r.get()?;
            let mut data = vec![0u8; r.remaining()];
            if !r.read_exact(&mut data) {
                return None;
            }
            Some(BgpBody::Notification {
                error_code,
                error_subcode,
                data,
            })
        }
        BgpType::Keepalive => {
            if r.remaining() != 0 {
                return None;
            }
            Some(BgpBody::Keepalive)
        }
    }
}

/// Serializes one message, marker and length included.
pub fn encode(msg: &BgpMessage, out: &mut Data) {
    let mut body = Data::new();
    match &msg.body {
        BgpBody::Open {
            version,
            my_as,
            hold_time,
            identifier,
            parameters,
        } => {
            body.push_u8(*version);
            body.push_slice(&my_as.to_be_bytes());
            body.push_slice(&hold_time.to_be_bytes());
            body.push_slice(identifier);
            body.push_u8(parameters.len() as u8);
            body.push_slice(parameters);
        }
        BgpBody::Update {
            withdrawn,
            path_attributes,
            destinations,
        } => {
            let mut w = Data::new();
            for p in withdrawn {
                write_prefix(&mut w, p);
            }
            body.push_slice(&(w.len() as u16).to_be_bytes());
            body.push(w);
            let mut a = Data::new();
            for attr in path_attributes {
                write_path_attribute(&mut a, attr);
            }
            body.push_slice(&(a.len() as u16).to_be_bytes());
            body.push(a);
            for p in destinations {
                write_prefix(&mut body, p);
            }
        }
        BgpBody::Notification {
            error_code,
            error_subcode,
            data,
        } => {
            body.push_u8(*error_code);
            body.push_u8(*error_subcode);
            body.push_slice(data);
        }
        BgpBody::Keepalive => {}
    }
    out.push_slice(&[0xff; 16]);
    out.push_slice(&((HEADER_SIZE + body.len()) as u16).to_be_bytes());
    out.push_u8(msg.message_type as u8);
    out.push(body);
}

// ---- streaming parser ----

const STATE_HEADER: i32 = 0;
const STATE_BODY: i32 = 1;

struct ParserInner {
    message_type: Option<BgpType>,
    error: bool,
}

impl ParserInner {
    fn emit(&mut self, body: Data, out: &mut dyn FnMut(Event)) -> i32 {
        let message_type = self.message_type.take().expect("header was parsed");
        match parse_body(message_type, &body) {
            Some(parsed) => {
                out(Event::message_start(Some(MessageHead::Bgp(BgpMessage {
                    message_type,
                    body: parsed,
                }))));
                out(Event::message_end(None));
                STATE_HEADER
            }
            None => {
                self.error = true;
                out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                STATE_ERROR
            }
        }
    }
}

impl Deframe for ParserInner {
    fn on_state(
        &mut self,
        state: i32,
        input: Input,
        cmd: &mut ReadCmd,
        out: &mut dyn FnMut(Event),
    ) -> i32 {
        match (state, input) {
            (STATE_HEADER, Input::Filled(buf)) => {
                if buf[..16].iter().any(|b| *b != 0xff) {
                    self.error = true;
                    out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                    return STATE_ERROR;
                }
                let length = BigEndian::read_u16(&buf[16..18]) as usize;
                let message_type = match BgpType::from_code(buf[18]) {
                    Some(t) if length >= HEADER_SIZE && length <= 4096 => t,
                    _ => {
                        self.error = true;
                        out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                        return STATE_ERROR;
                    }
                };
                self.message_type = Some(message_type);
                let body_len = length - HEADER_SIZE;
                if body_len == 0 {
                    let next = self.emit(Data::new(), out);
                    if next == STATE_HEADER {
                        cmd.fill(HEADER_SIZE);
                    }
                    next
                } else {
                    cmd.fill_data(body_len);
                    STATE_BODY
                }
            }
            (STATE_BODY, Input::FilledData(body)) => {
                let next = self.emit(body, out);
                if next == STATE_HEADER {
                    cmd.fill(HEADER_SIZE);
                }
                next
            }
            _ => STATE_ERROR,
        }
    }
}

/// BGP decoder filter: one message event pair per wire message.
pub struct Decoder {
    deframer: Deframer,
    inner: ParserInner,
}

impl Decoder {
    pub fn new() -> Decoder {
        let mut deframer = Deframer::new(STATE_HEADER);
        deframer.arm(|cmd| cmd.fill(HEADER_SIZE));
        Decoder {
            deframer,
            inner: ParserInner {
                message_type: None,
                error: false,
            },
        }
    }
}

impl Filter for Decoder {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::Data(mut data) => {
                if !self.inner.error {
                    self.deframer.deframe(&mut self.inner, &mut data, out);
                }
            }
            Event::StreamEnd(eos) => {
                if self.deframer.is_mid_frame() && !self.inner.error {
                    out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                } else if !self.inner.error {
                    out(Event::StreamEnd(eos));
                }
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.deframer.reset(STATE_HEADER);
        self.deframer.arm(|cmd| cmd.fill(HEADER_SIZE));
        self.inner.message_type = None;
        self.inner.error = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: BgpMessage) {
        let mut wire = Data::new();
        encode(&msg, &mut wire);

        let mut decoder = Decoder::new();
        let mut ctx = FilterCtx::new(None);
        let mut got = Vec::new();
        decoder.process(&mut ctx, Event::Data(wire), &mut |e| got.push(e));

        match got.first() {
            Some(Event::MessageStart(start)) => match start.head.as_ref().unwrap() {
                MessageHead::Bgp(m) => assert_eq!(*m, msg),
                other => panic!("unexpected head {:?}", other),
            },
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_keepalive_round_trip() {
        let msg = BgpMessage {
            message_type: BgpType::Keepalive,
            body: BgpBody::Keepalive,
        };
        let mut wire = Data::new();
        encode(&msg, &mut wire);
        assert_eq!(wire.len(), HEADER_SIZE);
        round_trip(msg);
    }

    #[test]
    fn test_open_round_trip() {
        round_trip(BgpMessage {
            message_type: BgpType::Open,
            body: BgpBody::Open {
                version: 4,
                my_as: 65001,
                hold_time: 180,
                identifier: [10, 0, 0, 1],
                parameters: vec![2, 2, 0x41, 4],
            },
        });
    }

    #[test]
    fn test_update_round_trip() {
        round_trip(BgpMessage {
            message_type: BgpType::Update,
            body: BgpBody::Update {
                withdrawn: vec![Prefix::new([10, 1, 0, 0], 16)],
                path_attributes: vec![
                    PathAttribute {
                        code: 1,
                        optional: false,
                        transitive: true,
                        partial: false,
                        value: AttrValue::Origin(0),
                    },
                    PathAttribute {
                        code: 2,
                        optional: false,
                        transitive: true,
                        partial: false,
                        value: AttrValue::AsPath(vec![(2, vec![65001, 65002])]),
                    },
                    PathAttribute {
                        code: 3,
                        optional: false,
                        transitive: true,
                        partial: false,
                        value: AttrValue::NextHop([192, 168, 0, 1]),
                    },
                ],
                destinations: vec![Prefix::new([10, 2, 3, 0], 24), Prefix::new([0, 0, 0, 0], 0)],
            },
        });
    }

    #[test]
    fn test_notification_round_trip() {
        round_trip(BgpMessage {
            message_type: BgpType::Notification,
            body: BgpBody::Notification {
                error_code: 6,
                error_subcode: 2,
                data: vec![1, 2, 3],
            },
        });
    }

    #[test]
    fn test_bad_marker_is_protocol_error() {
        let mut wire = vec![0u8; HEADER_SIZE];
        wire[16] = 0;
        wire[17] = HEADER_SIZE as u8;
        wire[18] = 4;

        let mut decoder = Decoder::new();
        let mut ctx = FilterCtx::new(None);
        let mut got = Vec::new();
        decoder.process(&mut ctx, Event::Data(Data::from_slice(&wire)), &mut |e| {
            got.push(e)
        });
        assert!(matches!(
            got.last(),
            Some(Event::StreamEnd(e)) if e.error == Some(ErrorKind::ProtocolError)
        ));
    }

    #[test]
    fn test_messages_split_across_chunks() {
        let msg = BgpMessage {
            message_type: BgpType::Keepalive,
            body: BgpBody::Keepalive,
        };
        let mut wire = Data::new();
        encode(&msg, &mut wire);
        encode(&msg, &mut wire);
        let bytes = wire.to_vec();

        let mut decoder = Decoder::new();
        let mut ctx = FilterCtx::new(None);
        let mut starts = 0;
        for b in bytes {
            decoder.process(&mut ctx, Event::Data(Data::from_slice(&[b])), &mut |e| {
                if matches!(e, Event::MessageStart(_)) {
                    starts += 1;
                }
            });
        }
        assert_eq!(starts, 2);
    }
}
