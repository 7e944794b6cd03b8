use byteorder::{BigEndian, ByteOrder};

use crate::data::Data;
use crate::deframer::{Deframe, Deframer, Input, ReadCmd, STATE_ERROR};
use crate::event::{ErrorKind, Event, MessageHead};
use crate::pipeline::{Filter, FilterCtx};

/// Dubbo frame header fields: two magic bytes `DA BB`, one flags byte, one
/// status byte, an 8-byte request id and a 4-byte body length, big-endian.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DubboHead {
    pub id: u64,
    pub status: u8,
    pub is_request: bool,
    pub is_two_way: bool,
    pub is_event: bool,
}

pub const HEADER_SIZE: usize = 16;

const STATE_HEAD: i32 = 0;
const STATE_BODY: i32 = 1;

struct DecoderInner {
    error: bool,
}

impl Deframe for DecoderInner {
    fn on_state(
        &mut self,
        state: i32,
        input: Input,
        cmd: &mut ReadCmd,
        out: &mut dyn FnMut(Event),
    ) -> i32 {
        match (state, input) {
            (STATE_HEAD, Input::Filled(buf)) => {
                if buf[0] != 0xda || buf[1] != 0xbb {
                    self.error = true;
                    out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                    return STATE_ERROR;
                }
                let flags = buf[2];
                let head = DubboHead {
                    id: BigEndian::read_u64(&buf[4..12]),
                    status: buf[3],
                    is_request: flags & 0x80 != 0,
                    is_two_way: flags & 0x40 != 0,
                    is_event: flags & 0x20 != 0,
                };
                let length = BigEndian::read_u32(&buf[12..16]) as usize;
                out(Event::message_start(Some(MessageHead::Dubbo(head))));
                if length == 0 {
                    out(Event::message_end(None));
                    cmd.fill(HEADER_SIZE);
                    STATE_HEAD
                } else {
                    cmd.pass(length);
                    STATE_BODY
                }
            }
            (STATE_BODY, Input::Filled(_)) => {
                out(Event::message_end(None));
                cmd.fill(HEADER_SIZE);
                STATE_HEAD
            }
            _ => STATE_ERROR,
        }
    }
}

/// Dubbo decoder: frame header to `MessageStart`, body passed through.
pub struct Decoder {
    deframer: Deframer,
    inner: DecoderInner,
}

impl Decoder {
    pub fn new() -> Decoder {
        let mut deframer = Deframer::new(STATE_HEAD);
        deframer.arm(|cmd| cmd.fill(HEADER_SIZE));
        Decoder {
            deframer,
            inner: DecoderInner { error: false },
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
                } else {
                    out(Event::StreamEnd(eos));
                }
                self.reset();
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.deframer.reset(STATE_HEAD);
        self.deframer.arm(|cmd| cmd.fill(HEADER_SIZE));
        self.inner.error = false;
    }
}

/// Dubbo encoder: buffers the body, then emits the 16-byte header followed
/// by the body bytes. Messages without a head get an auto-incremented id.
pub struct Encoder {
    buffer: Option<Data>,
    head: Option<DubboHead>,
    auto_id: u64,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            buffer: None,
            head: None,
            auto_id: 0,
        }
    }
}

impl Filter for Encoder {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::MessageStart(start) => {
                self.head = match start.head {
                    Some(MessageHead::Dubbo(h)) => Some(h),
                    _ => None,
                };
                self.buffer = Some(Data::new());
            }
            Event::Data(data) => {
                if let Some(buf) = self.buffer.as_mut() {
                    buf.push(data);
                }
            }
            Event::MessageEnd(end) => {
                let body = match self.buffer.take() {
                    Some(b) => b,
                    None => return,
                };
                let head = self.head.take().unwrap_or_else(|| {
                    let id = self.auto_id;
                    self.auto_id += 1;
                    DubboHead {
                        id,
                        status: 0,
                        is_request: true,
                        is_two_way: true,
                        is_event: false,
                    }
                });
                // Serialization id 2 (hessian2) in the low bits, on requests
                // and responses alike.
                let mut flags = 0x02u8;
                if head.is_request {
                    flags |= 0x80;
                }
                if head.is_two_way {
                    flags |= 0x40;
                }
                if head.is_event {
                    flags |= 0x20;
                }
                let mut header = [0u8; HEADER_SIZE];
                header[0] = 0xda;
                header[1] = 0xbb;
                header[2] = flags;
                header[3] = head.status;
                BigEndian::write_u64(&mut header[4..12], head.id);
                BigEndian::write_u32(&mut header[12..16], body.len() as u32);

                out(Event::message_start(Some(MessageHead::Dubbo(head))));
                let mut bytes = Data::from_slice(&header);
                bytes.push(body);
                out(Event::Data(bytes));
                out(Event::MessageEnd(end));
            }
            Event::StreamEnd(eos) => {
                self.buffer = None;
                self.head = None;
                out(Event::StreamEnd(eos));
            }
        }
    }

    fn reset(&mut self) {
        self.buffer = None;
        self.head = None;
        self.auto_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Vec<Event> {
        let mut decoder = Decoder::new();
        let mut ctx = FilterCtx::new(None);
        let mut got = Vec::new();
        decoder.process(&mut ctx, Event::Data(Data::from_slice(bytes)), &mut |e| {
            got.push(e)
        });
        got
    }

    fn wire(head: &DubboHead, body: &[u8]) -> Vec<u8> {
        let mut encoder = Encoder::new();
        let mut ctx = FilterCtx::new(None);
        let mut bytes = Vec::new();
        for evt in vec![
            Event::message_start(Some(MessageHead::Dubbo(head.clone()))),
            Event::Data(Data::from_slice(body)),
            Event::message_end(None),
        ] {
            encoder.process(&mut ctx, evt, &mut |e| {
                if let Event::Data(d) = e {
                    bytes.extend_from_slice(&d.to_vec());
                }
            });
        }
        bytes
    }

    #[test]
    fn test_round_trip() {
        let head = DubboHead {
            id: 0x0102_0304_0506_0708,
            status: 20,
            is_request: true,
            is_two_way: true,
            is_event: false,
        };
        let bytes = wire(&head, b"payload");
        assert_eq!(&bytes[..2], &[0xda, 0xbb]);
        // request + two-way + serialization id 2
        assert_eq!(bytes[2], 0xc2);
        assert_eq!(bytes.len(), HEADER_SIZE + 7);

        let got = decode(&bytes);
        assert_eq!(got.len(), 3);
        match &got[0] {
            Event::MessageStart(start) => match start.head.as_ref().unwrap() {
                MessageHead::Dubbo(h) => assert_eq!(*h, head),
                other => panic!("unexpected head {:?}", other),
            },
            other => panic!("unexpected event {:?}", other),
        }
        match &got[1] {
            Event::Data(d) => assert_eq!(d.to_vec(), b"payload"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(got[2], Event::MessageEnd(_)));
    }

    #[test]
    fn test_zero_length_body() {
        let head = DubboHead {
            id: 1,
            status: 0,
            is_request: false,
            is_two_way: false,
            is_event: true,
        };
        let bytes = wire(&head, b"");
        // Responses carry the serialization id too.
        assert_eq!(bytes[2], 0x22);
        let got = decode(&bytes);
        assert_eq!(got.len(), 2);
        assert!(matches!(got[1], Event::MessageEnd(_)));
    }

    #[test]
    fn test_bad_magic_is_protocol_error() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0] = 0xde;
        bytes[1] = 0xad;
        let got = decode(&bytes);
        assert!(matches!(
            got.last(),
            Some(Event::StreamEnd(e)) if e.error == Some(ErrorKind::ProtocolError)
        ));
    }

    #[test]
    fn test_split_header_across_events() {
        let head = DubboHead {
            id: 42,
            status: 0,
            is_request: true,
            is_two_way: true,
            is_event: false,
        };
        let bytes = wire(&head, b"xy");

        let mut decoder = Decoder::new();
        let mut ctx = FilterCtx::new(None);
        let mut got = Vec::new();
        for piece in bytes.chunks(3) {
            decoder.process(&mut ctx, Event::Data(Data::from_slice(piece)), &mut |e| {
                got.push(e)
            });
        }
        assert_eq!(got.len(), 3);
        match &got[1] {
            Event::Data(d) => assert_eq!(d.to_vec(), b"xy"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
