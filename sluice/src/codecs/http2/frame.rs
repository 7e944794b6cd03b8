use byteorder::{BigEndian, ByteOrder};

use crate::data::Data;
use crate::deframer::{Deframe, Input, ReadCmd, STATE_ERROR};
use crate::event::Event;

pub const FRAME_HEADER_SIZE: usize = 9;
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

pub const BIT_ACK: u8 = 0x01;
pub const BIT_END_STREAM: u8 = 0x01;
pub const BIT_END_HEADERS: u8 = 0x04;
pub const BIT_PADDED: u8 = 0x08;
pub const BIT_PRIORITY: u8 = 0x20;

#[derive(Debug)]
pub struct Frame {
    pub stream_id: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub payload: Data,
}

impl Frame {
    pub fn new(stream_id: u32, frame_type: u8, flags: u8) -> Frame {
        Frame {
            stream_id,
            frame_type,
            flags,
            payload: Data::new(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & BIT_ACK != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & BIT_END_STREAM != 0
    }

    pub fn is_end_headers(&self) -> bool {
        self.flags & BIT_END_HEADERS != 0
    }

    pub fn is_padded(&self) -> bool {
        self.flags & BIT_PADDED != 0
    }

    pub fn is_priority(&self) -> bool {
        self.flags & BIT_PRIORITY != 0
    }

    pub fn decode_window_update(&self) -> Result<u32, ErrorCode> {
        if self.payload.len() != 4 {
            return Err(ErrorCode::FrameSizeError);
        }
        let mut buf = [0u8; 4];
        self.payload.to_bytes(&mut buf);
        Ok(BigEndian::read_u32(&buf) & 0x7fff_ffff)
    }

    pub fn encode_window_update(increment: u32, stream_id: u32) -> Frame {
        let mut frm = Frame::new(stream_id, frame_type::WINDOW_UPDATE, 0);
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, increment & 0x7fff_ffff);
        frm.payload.push_slice(&buf);
        frm
    }
}

/// SETTINGS parameter block.
#[derive(Debug, Clone)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            header_table_size: 0x1000,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 0xffff,
            max_frame_size: 0x4000,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    pub fn decode(&mut self, data: &[u8]) -> Result<(), ErrorCode> {
        let mut i = 0;
        while i + 6 <= data.len() {
            let k = BigEndian::read_u16(&data[i..]);
            let v = BigEndian::read_u32(&data[i + 2..]);
            match k {
                0x1 => self.header_table_size = v,
                0x2 => {
                    if v > 1 {
                        return Err(ErrorCode::ProtocolError);
                    }
                    self.enable_push = v == 1;
                }
                0x3 => self.max_concurrent_streams = Some(v),
                0x4 => {
                    if v > 0x7fff_ffff {
                        return Err(ErrorCode::FlowControlError);
                    }
                    self.initial_window_size = v;
                }
                0x5 => {
                    if v < 0x4000 || v > 0xff_ffff {
                        return Err(ErrorCode::ProtocolError);
                    }
                    self.max_frame_size = v;
                }
                0x6 => self.max_header_list_size = Some(v),
                _ => {}
            }
            i += 6;
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut write = |k: u16, v: u32| {
            let mut buf = [0u8; 6];
            BigEndian::write_u16(&mut buf, k);
            BigEndian::write_u32(&mut buf[2..], v);
            out.extend_from_slice(&buf);
        };
        write(0x1, self.header_table_size);
        write(0x2, if self.enable_push { 1 } else { 0 });
        if let Some(n) = self.max_concurrent_streams {
            write(0x3, n);
        }
        write(0x4, self.initial_window_size);
        write(0x5, self.max_frame_size);
        if let Some(n) = self.max_header_list_size {
            write(0x6, n);
        }
        out
    }
}

const STATE_PREFACE: i32 = 0;
const STATE_HEADER: i32 = 1;
const STATE_PAYLOAD: i32 = 2;

/// Reads 9-byte frame headers then payloads, enforcing `max_frame_size` and
/// the fixed sizes of RST_STREAM and PRIORITY. Collected frames are handed
/// to the endpoint after each deframe pass.
pub struct FrameDecoder {
    pending: Frame,
    pub frames: Vec<Frame>,
    pub error: Option<ErrorCode>,
    pub max_frame_size: u32,
    expect_preface: bool,
}

impl FrameDecoder {
    pub fn new(expect_preface: bool) -> FrameDecoder {
        FrameDecoder {
            pending: Frame::new(0, 0, 0),
            frames: Vec::new(),
            error: None,
            max_frame_size: 0x4000,
            expect_preface,
        }
    }

    pub fn initial_state(&self) -> i32 {
        if self.expect_preface {
            STATE_PREFACE
        } else {
            STATE_HEADER
        }
    }

    pub fn arm(&self, cmd: &mut ReadCmd) {
        if self.expect_preface {
            cmd.fill(PREFACE.len());
        } else {
            cmd.fill(FRAME_HEADER_SIZE);
        }
    }
}

impl Deframe for FrameDecoder {
    fn on_state(
        &mut self,
        state: i32,
        input: Input,
        cmd: &mut ReadCmd,
        _out: &mut dyn FnMut(Event),
    ) -> i32 {
        match (state, input) {
            (STATE_PREFACE, Input::Filled(bytes)) => {
                if bytes != PREFACE {
                    self.error = Some(ErrorCode::ProtocolError);
                    return STATE_ERROR;
                }
                cmd.fill(FRAME_HEADER_SIZE);
                STATE_HEADER
            }
            (STATE_HEADER, Input::Filled(buf)) => {
                let size = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32;
                self.pending.frame_type = buf[3];
                self.pending.flags = buf[4];
                self.pending.stream_id = BigEndian::read_u32(&buf[5..9]) & 0x7fff_ffff;
                if size > self.max_frame_size {
                    self.error = Some(ErrorCode::FrameSizeError);
                    return STATE_ERROR;
                }
                if (self.pending.frame_type == frame_type::RST_STREAM && size != 4)
                    || (self.pending.frame_type == frame_type::PRIORITY && size != 5)
                {
                    self.error = Some(ErrorCode::FrameSizeError);
                    return STATE_ERROR;
                }
                if size > 0 {
                    cmd.fill_data(size as usize);
                    STATE_PAYLOAD
                } else {
                    let frm = std::mem::replace(&mut self.pending, Frame::new(0, 0, 0));
                    self.frames.push(frm);
                    cmd.fill(FRAME_HEADER_SIZE);
                    STATE_HEADER
                }
            }
            (STATE_PAYLOAD, Input::FilledData(data)) => {
                self.pending.payload = data;
                let frm = std::mem::replace(&mut self.pending, Frame::new(0, 0, 0));
                self.frames.push(frm);
                cmd.fill(FRAME_HEADER_SIZE);
                STATE_HEADER
            }
            _ => {
                self.error = Some(ErrorCode::ProtocolError);
                STATE_ERROR
            }
        }
    }
}

/// Emits frames directly into an output buffer that is later packed into one
/// `Data`.
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn frame(frm: Frame, out: &mut Data) {
        let mut head = [0u8; FRAME_HEADER_SIZE];
        let size = frm.payload.len();
        head[0] = (size >> 16) as u8;
        head[1] = (size >> 8) as u8;
        head[2] = size as u8;
        head[3] = frm.frame_type;
        head[4] = frm.flags;
        BigEndian::write_u32(&mut head[5..9], frm.stream_id & 0x7fff_ffff);
        out.push_slice(&head);
        out.push(frm.payload);
    }

    pub fn rst_stream(id: u32, err: ErrorCode, out: &mut Data) {
        let mut frm = Frame::new(id, frame_type::RST_STREAM, 0);
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, err as u32);
        frm.payload.push_slice(&buf);
        Self::frame(frm, out);
    }

    pub fn goaway(last_stream_id: u32, err: ErrorCode, out: &mut Data) {
        let mut frm = Frame::new(0, frame_type::GOAWAY, 0);
        let mut buf = [0u8; 8];
        BigEndian::write_u32(&mut buf, last_stream_id & 0x7fff_ffff);
        BigEndian::write_u32(&mut buf[4..], err as u32);
        frm.payload.push_slice(&buf);
        Self::frame(frm, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deframer::Deframer;

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<Frame> {
        let mut deframer = Deframer::new(decoder.initial_state());
        deframer.arm(|cmd| decoder.arm(cmd));
        let mut data = Data::from_slice(bytes);
        deframer.deframe(decoder, &mut data, &mut |_| {});
        std::mem::take(&mut decoder.frames)
    }

    #[test]
    fn test_frame_round_trip() {
        let mut frm = Frame::new(5, frame_type::DATA, BIT_END_STREAM);
        frm.payload.push_slice(b"hello");
        let mut wire = Data::new();
        FrameEncoder::frame(frm, &mut wire);

        let mut decoder = FrameDecoder::new(false);
        let frames = decode_all(&mut decoder, &wire.to_vec());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, 5);
        assert_eq!(frames[0].frame_type, frame_type::DATA);
        assert!(frames[0].is_end_stream());
        assert_eq!(frames[0].payload.to_vec(), b"hello");
    }

    #[test]
    fn test_zero_payload_frame() {
        let frm = Frame::new(1, frame_type::DATA, BIT_END_STREAM);
        let mut wire = Data::new();
        FrameEncoder::frame(frm, &mut wire);

        let mut decoder = FrameDecoder::new(false);
        let frames = decode_all(&mut decoder, &wire.to_vec());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
        assert!(frames[0].is_end_stream());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut wire = Data::new();
        // 3-byte length far beyond max_frame_size.
        wire.push_slice(&[0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 1]);
        let mut decoder = FrameDecoder::new(false);
        decode_all(&mut decoder, &wire.to_vec());
        assert_eq!(decoder.error, Some(ErrorCode::FrameSizeError));
    }

    #[test]
    fn test_bad_rst_stream_size() {
        let mut frm = Frame::new(1, frame_type::RST_STREAM, 0);
        frm.payload.push_slice(&[0u8; 3]);
        let mut wire = Data::new();
        FrameEncoder::frame(frm, &mut wire);
        let mut decoder = FrameDecoder::new(false);
        decode_all(&mut decoder, &wire.to_vec());
        assert_eq!(decoder.error, Some(ErrorCode::FrameSizeError));
    }

    #[test]
    fn test_preface_requirement() {
        let mut wire = Data::new();
        wire.push_slice(PREFACE);
        let frm = Frame::new(0, frame_type::SETTINGS, 0);
        let mut out = Data::new();
        FrameEncoder::frame(frm, &mut out);
        wire.push(out);

        let mut decoder = FrameDecoder::new(true);
        let frames = decode_all(&mut decoder, &wire.to_vec());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, frame_type::SETTINGS);

        let mut bad = FrameDecoder::new(true);
        decode_all(&mut bad, &[0u8; 24]);
        assert_eq!(bad.error, Some(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_settings_round_trip() {
        let mut settings = Settings::default();
        settings.initial_window_size = 16384;
        settings.max_concurrent_streams = Some(10);
        let bytes = settings.encode();

        let mut parsed = Settings::default();
        parsed.decode(&bytes).unwrap();
        assert_eq!(parsed.initial_window_size, 16384);
        assert_eq!(parsed.max_concurrent_streams, Some(10));
    }

    #[test]
    fn test_settings_rejects_bad_window() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x00, 0x04]);
        buf.extend_from_slice(&0x8000_0000u32.to_be_bytes());
        let mut settings = Settings::default();
        assert_eq!(settings.decode(&buf), Err(ErrorCode::FlowControlError));
    }

    #[test]
    fn test_window_update_codec() {
        let frm = Frame::encode_window_update(12345, 7);
        assert_eq!(frm.stream_id, 7);
        assert_eq!(frm.decode_window_update().unwrap(), 12345);
    }
}
