use std::collections::VecDeque;

use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::codecs::http2::frame::ErrorCode;
use crate::data::Data;
use crate::event::{Headers, MessageHead, RequestHead, ResponseHead};

/// The 61 predefined header fields of RFC 7541 Appendix A.
static STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// RFC 7541 Appendix B Huffman codes, indexed by symbol; entry 256 is EOS.
#[rustfmt::skip]
static HUFFMAN_TABLE: &[(u32, u8)] = &[
    (0x00001ff8, 13), (0x007fffd8, 23), (0x0fffffe2, 28), (0x0fffffe3, 28),
    (0x0fffffe4, 28), (0x0fffffe5, 28), (0x0fffffe6, 28), (0x0fffffe7, 28),
    (0x0fffffe8, 28), (0x00ffffea, 24), (0x3ffffffc, 30), (0x0fffffe9, 28),
    (0x0fffffea, 28), (0x3ffffffd, 30), (0x0fffffeb, 28), (0x0fffffec, 28),
    (0x0fffffed, 28), (0x0fffffee, 28), (0x0fffffef, 28), (0x0ffffff0, 28),
    (0x0ffffff1, 28), (0x0ffffff2, 28), (0x3ffffffe, 30), (0x0ffffff3, 28),
    (0x0ffffff4, 28), (0x0ffffff5, 28), (0x0ffffff6, 28), (0x0ffffff7, 28),
    (0x0ffffff8, 28), (0x0ffffff9, 28), (0x0ffffffa, 28), (0x0ffffffb, 28),
    (0x00000014,  6), (0x000003f8, 10), (0x000003f9, 10), (0x00000ffa, 12),
    (0x00001ff9, 13), (0x00000015,  6), (0x000000f8,  8), (0x000007fa, 11),
    (0x000003fa, 10), (0x000003fb, 10), (0x000000f9,  8), (0x000007fb, 11),
    (0x000000fa,  8), (0x00000016,  6), (0x00000017,  6), (0x00000018,  6),
    (0x00000000,  5), (0x00000001,  5), (0x00000002,  5), (0x00000019,  6),
    (0x0000001a,  6), (0x0000001b,  6), (0x0000001c,  6), (0x0000001d,  6),
    (0x0000001e,  6), (0x0000001f,  6), (0x0000005c,  7), (0x000000fb,  8),
    (0x00007ffc, 15), (0x00000020,  6), (0x00000ffb, 12), (0x000003fc, 10),
    (0x00001ffa, 13), (0x00000021,  6), (0x0000005d,  7), (0x0000005e,  7),
    (0x0000005f,  7), (0x00000060,  7), (0x00000061,  7), (0x00000062,  7),
    (0x00000063,  7), (0x00000064,  7), (0x00000065,  7), (0x00000066,  7),
    (0x00000067,  7), (0x00000068,  7), (0x00000069,  7), (0x0000006a,  7),
    (0x0000006b,  7), (0x0000006c,  7), (0x0000006d,  7), (0x0000006e,  7),
    (0x0000006f,  7), (0x00000070,  7), (0x00000071,  7), (0x00000072,  7),
    (0x000000fc,  8), (0x00000073,  7), (0x000000fd,  8), (0x00001ffb, 13),
    (0x0007fff0, 19), (0x00001ffc, 13), (0x00003ffc, 14), (0x00000022,  6),
    (0x00007ffd, 15), (0x00000003,  5), (0x00000023,  6), (0x00000004,  5),
    (0x00000024,  6), (0x00000005,  5), (0x00000025,  6), (0x00000026,  6),
    (0x00000027,  6), (0x00000006,  5), (0x00000074,  7), (0x00000075,  7),
    (0x00000028,  6), (0x00000029,  6), (0x0000002a,  6), (0x00000007,  5),
    (0x0000002b,  6), (0x00000076,  7), (0x0000002c,  6), (0x00000008,  5),
    (0x00000009,  5), (0x0000002d,  6), (0x00000077,  7), (0x00000078,  7),
    (0x00000079,  7), (0x0000007a,  7), (0x0000007b,  7), (0x00007ffe, 15),
    (0x000007fc, 11), (0x00003ffd, 14), (0x00001ffd, 13), (0x0ffffffc, 28),
    (0x000fffe6, 20), (0x003fffd2, 22), (0x000fffe7, 20), (0x000fffe8, 20),
    (0x003fffd3, 22), (0x003fffd4, 22), (0x003fffd5, 22), (0x007fffd9, 23),
    (0x003fffd6, 22), (0x007fffda, 23), (0x007fffdb, 23), (0x007fffdc, 23),
    (0x007fffdd, 23), (0x007fffde, 23), (0x00ffffeb, 24), (0x007fffdf, 23),
    (0x00ffffec, 24), (0x00ffffed, 24), (0x003fffd7, 22), (0x007fffe0, 23),
    (0x00ffffee, 24), (0x007fffe1, 23), (0x007fffe2, 23), (0x007fffe3, 23),
    (0x007fffe4, 23), (0x001fffdc, 21), (0x003fffd8, 22), (0x007fffe5, 23),
    (0x003fffd9, 22), (0x007fffe6, 23), (0x007fffe7, 23), (0x00ffffef, 24),
    (0x003fffda, 22), (0x001fffdd, 21), (0x000fffe9, 20), (0x003fffdb, 22),
    (0x003fffdc, 22), (0x007fffe8, 23), (0x007fffe9, 23), (0x001fffde, 21),
    (0x007fffea, 23), (0x003fffdd, 22), (0x003fffde, 22), (0x00fffff0, 24),
    (0x001fffdf, 21), (0x003fffdf, 22), (0x007fffeb, 23), (0x007fffec, 23),
    (0x001fffe0, 21), (0x001fffe1, 21), (0x003fffe0, 22), (0x001fffe2, 21),
    (0x007fffed, 23), (0x003fffe1, 22), (0x007fffee, 23), (0x007fffef, 23),
    (0x000fffea, 20), (0x003fffe2, 22), (0x003fffe3, 22), (0x003fffe4, 22),
    (0x007ffff0, 23), (0x003fffe5, 22), (0x003fffe6, 22), (0x007ffff1, 23),
    (0x03ffffe0, 26), (0x03ffffe1, 26), (0x000fffeb, 20), (0x0007fff1, 19),
    (0x003fffe7, 22), (0x007ffff2, 23), (0x003fffe8, 22), (0x01ffffec, 25),
    (0x03ffffe2, 26), (0x03ffffe3, 26), (0x03ffffe4, 26), (0x07ffffde, 27),
    (0x07ffffdf, 27), (0x03ffffe5, 26), (0x00fffff1, 24), (0x01ffffed, 25),
    (0x0007fff2, 19), (0x001fffe3, 21), (0x03ffffe6, 26), (0x07ffffe0, 27),
    (0x07ffffe1, 27), (0x03ffffe7, 26), (0x07ffffe2, 27), (0x00fffff2, 24),
    (0x001fffe4, 21), (0x001fffe5, 21), (0x03ffffe8, 26), (0x03ffffe9, 26),
    (0x0ffffffd, 28), (0x07ffffe3, 27), (0x07ffffe4, 27), (0x07ffffe5, 27),
    (0x000fffec, 20), (0x00fffff3, 24), (0x000fffed, 20), (0x001fffe6, 21),
    (0x003fffe9, 22), (0x001fffe7, 21), (0x001fffe8, 21), (0x007ffff3, 23),
    (0x003fffea, 22), (0x003fffeb, 22), (0x01ffffee, 25), (0x01ffffef, 25),
    (0x00fffff4, 24), (0x00fffff5, 24), (0x03ffffea, 26), (0x007ffff4, 23),
    (0x03ffffeb, 26), (0x07ffffe6, 27), (0x03ffffec, 26), (0x03ffffed, 26),
    (0x07ffffe7, 27), (0x07ffffe8, 27), (0x07ffffe9, 27), (0x07ffffea, 27),
    (0x07ffffeb, 27), (0x0ffffffe, 28), (0x07ffffec, 27), (0x07ffffed, 27),
    (0x07ffffee, 27), (0x07ffffef, 27), (0x07fffff0, 27), (0x03ffffee, 26),
    (0x3fffffff, 30),
];

/// Binary decode tree: a node's `left == 0` marks a leaf whose `right` holds
/// the symbol.
#[derive(Default, Copy, Clone)]
struct HuffmanNode {
    left: u16,
    right: u16,
}

struct EncoderEntry {
    index: usize,
    values: Vec<(&'static str, usize)>,
}

lazy_static! {
    static ref HUFFMAN_TREE: Vec<HuffmanNode> = {
        let mut tree = vec![HuffmanNode::default()];
        for (symbol, &(code, bits)) in HUFFMAN_TABLE.iter().enumerate() {
            let mut ptr = 0usize;
            for b in (0..bits).rev() {
                let bit = (code >> b) & 1 == 1;
                let next = (if bit { tree[ptr].right } else { tree[ptr].left }) as usize;
                if next == 0 {
                    let new = tree.len() as u16;
                    if bit {
                        tree[ptr].right = new;
                    } else {
                        tree[ptr].left = new;
                    }
                    tree.push(HuffmanNode::default());
                    ptr = new as usize;
                } else {
                    ptr = next;
                }
            }
            tree[ptr].right = symbol as u16;
        }
        tree
    };
    static ref ENCODER_TABLE: HashMap<&'static str, EncoderEntry> = {
        let mut map: HashMap<&'static str, EncoderEntry> = HashMap::new();
        for (i, &(name, value)) in STATIC_TABLE.iter().enumerate() {
            let entry = map.entry(name).or_insert(EncoderEntry {
                index: i + 1,
                values: Vec::new(),
            });
            if !value.is_empty() {
                entry.values.push((value, i + 1));
            }
        }
        map
    };
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    IndexPrefix,
    IndexOctets,
    NamePrefix,
    NameLength,
    NameString,
    ValuePrefix,
    ValueLength,
    ValueString,
}

struct DecHead {
    method: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    path: Option<String>,
    status: Option<u16>,
    headers: Headers,
}

impl DecHead {
    fn new() -> DecHead {
        DecHead {
            method: None,
            scheme: None,
            authority: None,
            path: None,
            status: None,
            headers: Headers::new(),
        }
    }
}

/// HPACK header-block decoder. One per connection; `start` begins a block,
/// `decode` consumes HEADERS/CONTINUATION payloads, `end` yields the head.
pub struct HeaderDecoder {
    state: State,
    error: Option<ErrorCode>,
    is_response: bool,
    is_trailer: bool,
    is_new: bool,
    pseudo_end: bool,
    prefix: u8,
    entry_prefix: u8,
    int: u32,
    exp: u32,
    ptr: usize,
    buffer: Vec<u8>,
    name: String,
    head: Option<DecHead>,
    content_length: Option<usize>,
    max_table_size: usize,
    dynamic: VecDeque<(String, String)>,
    dynamic_size: usize,
    dynamic_capacity: usize,
}

impl HeaderDecoder {
    pub fn new(max_table_size: usize) -> HeaderDecoder {
        HeaderDecoder {
            state: State::IndexPrefix,
            error: None,
            is_response: false,
            is_trailer: false,
            is_new: false,
            pseudo_end: false,
            prefix: 0,
            entry_prefix: 0,
            int: 0,
            exp: 0,
            ptr: 0,
            buffer: Vec::new(),
            name: String::new(),
            head: None,
            content_length: None,
            max_table_size,
            dynamic: VecDeque::new(),
            dynamic_size: 0,
            dynamic_capacity: max_table_size,
        }
    }

    pub fn started(&self) -> bool {
        self.head.is_some()
    }

    pub fn is_trailer(&self) -> bool {
        self.is_trailer
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn start(&mut self, is_response: bool, is_trailer: bool) {
        self.state = State::IndexPrefix;
        self.error = None;
        self.is_response = is_response;
        self.is_trailer = is_trailer;
        self.pseudo_end = false;
        self.entry_prefix = 0;
        self.buffer.clear();
        self.head = Some(DecHead::new());
        if !is_trailer {
            self.content_length = None;
        }
    }

    pub fn decode(&mut self, data: &Data) -> Result<(), ErrorCode> {
        if self.head.is_none() {
            return Err(ErrorCode::InternalError);
        }
        let bytes = data.to_vec();
        for c in bytes {
            if let Some(err) = self.error {
                return Err(err);
            }
            self.step(c);
        }
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Finishes the block, yielding either a message head or, for trailer
    /// blocks, the raw header set.
    pub fn end(&mut self) -> Result<HeaderBlock, ErrorCode> {
        let head = self.head.take().ok_or(ErrorCode::InternalError)?;
        if self.state != State::IndexPrefix {
            return Err(ErrorCode::CompressionError); // incomplete header block
        }
        if (self.entry_prefix & 0xe0) == 0x20 {
            return Err(ErrorCode::CompressionError); // ended with a size update
        }
        if self.is_trailer {
            return Ok(HeaderBlock::Trailers(head.headers));
        }
        if self.is_response {
            let status = head.status.ok_or(ErrorCode::ProtocolError)?;
            Ok(HeaderBlock::Head(MessageHead::Response(ResponseHead {
                protocol: "HTTP/2".to_string(),
                status,
                status_text: String::new(),
                headers: head.headers,
            })))
        } else {
            let method = head.method.filter(|s| !s.is_empty());
            let scheme = head.scheme.filter(|s| !s.is_empty());
            let path = head.path.filter(|s| !s.is_empty());
            match (method, scheme, path) {
                (Some(method), Some(scheme), Some(path)) => {
                    let mut headers = head.headers;
                    if let Some(authority) = &head.authority {
                        if !headers.contains("host") {
                            headers.push("host", authority.clone());
                        }
                    }
                    Ok(HeaderBlock::Head(MessageHead::Request(RequestHead {
                        protocol: "HTTP/2".to_string(),
                        method,
                        path,
                        scheme: Some(scheme),
                        authority: head.authority,
                        headers,
                    })))
                }
                _ => Err(ErrorCode::ProtocolError), // missing mandatory pseudo-headers
            }
        }
    }

    fn error(&mut self, err: ErrorCode) {
        self.error = Some(err);
    }

    fn step(&mut self, c: u8) {
        match self.state {
            State::IndexPrefix => self.index_prefix(c),
            State::IndexOctets => {
                if self.read_int(c) {
                    self.index_end();
                }
            }
            State::NamePrefix => {
                self.prefix = c;
                self.int = (c & 0x7f) as u32;
                if self.int == 0x7f {
                    self.exp = 0;
                    self.state = State::NameLength;
                } else if self.int == 0 {
                    self.error(ErrorCode::CompressionError);
                } else {
                    self.ptr = 0;
                    self.state = State::NameString;
                }
            }
            State::NameLength => {
                if self.read_int(c) {
                    self.ptr = 0;
                    self.state = State::NameString;
                }
            }
            State::NameString => {
                if self.read_str(c, true) {
                    self.name = String::from_utf8_lossy(&self.buffer).into_owned();
                    self.buffer.clear();
                    self.value_entry();
                }
            }
            State::ValuePrefix => {
                self.prefix = c;
                self.int = (c & 0x7f) as u32;
                if self.int == 0x7f {
                    self.exp = 0;
                    self.state = State::ValueLength;
                } else if self.int == 0 {
                    self.commit_field(String::new());
                } else {
                    self.ptr = 0;
                    self.state = State::ValueString;
                }
            }
            State::ValueLength => {
                if self.read_int(c) {
                    self.ptr = 0;
                    self.state = State::ValueString;
                }
            }
            State::ValueString => {
                if self.read_str(c, false) {
                    let value = String::from_utf8_lossy(&self.buffer).into_owned();
                    self.buffer.clear();
                    self.commit_field(value);
                }
            }
        }
    }

    fn commit_field(&mut self, value: String) {
        let name = std::mem::take(&mut self.name);
        if self.add_field(&name, &value) {
            if self.is_new {
                self.insert_dynamic(name, value);
            }
            self.state = State::IndexPrefix;
        }
    }

    fn index_prefix(&mut self, prefix: u8) {
        let (mask, is_new) = if prefix & 0x80 == 0x80 {
            (0x7f, false)
        } else if prefix & 0xc0 == 0x40 {
            (0x3f, true)
        } else if prefix & 0xe0 == 0x20 {
            (0x1f, false)
        } else {
            (0x0f, false)
        };
        self.entry_prefix = prefix;
        self.prefix = prefix;
        self.is_new = is_new;
        self.int = (prefix & mask) as u32;
        if self.int == mask as u32 {
            self.exp = 0;
            self.state = State::IndexOctets;
        } else {
            self.index_end();
        }
    }

    fn index_end(&mut self) {
        let p = self.entry_prefix;
        if p & 0x80 == 0x80 {
            // Indexed field.
            if self.int == 0 {
                return self.error(ErrorCode::CompressionError);
            }
            let found = self
                .lookup(self.int as usize)
                .map(|(n, v)| (n.to_string(), v.to_string()));
            match found {
                Some((name, value)) => {
                    if self.add_field(&name, &value) {
                        self.state = State::IndexPrefix;
                    }
                }
                None => self.error(ErrorCode::CompressionError),
            }
        } else if p & 0xe0 == 0x20 {
            // Dynamic table size update.
            if self.int as usize > self.max_table_size {
                return self.error(ErrorCode::CompressionError);
            }
            self.dynamic_capacity = self.int as usize;
            self.evict();
            self.state = State::IndexPrefix;
        } else if self.int != 0 {
            // Literal with indexed name.
            let found = self.lookup(self.int as usize).map(|(n, _)| n.to_string());
            match found {
                Some(name) => {
                    self.name = name;
                    self.value_entry();
                }
                None => self.error(ErrorCode::CompressionError),
            }
        } else {
            self.state = State::NamePrefix;
        }
    }

    fn value_entry(&mut self) {
        self.state = State::ValuePrefix;
    }

    fn lookup(&self, i: usize) -> Option<(&str, &str)> {
        if i <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[i - 1];
            return Some((name, value));
        }
        let i = i - STATIC_TABLE.len() - 1;
        self.dynamic.get(i).map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn insert_dynamic(&mut self, name: String, value: String) {
        self.dynamic_size += 32 + name.len() + value.len();
        self.dynamic.push_front((name, value));
        self.evict();
    }

    fn evict(&mut self) {
        while self.dynamic_size > self.dynamic_capacity {
            if let Some((n, v)) = self.dynamic.pop_back() {
                self.dynamic_size -= 32 + n.len() + v.len();
            } else {
                break;
            }
        }
    }

    fn read_int(&mut self, c: u8) -> bool {
        self.int = self.int.wrapping_add(((c & 0x7f) as u32) << self.exp);
        if c & 0x80 != 0 {
            self.exp += 7;
            false
        } else {
            true
        }
    }

    fn read_str(&mut self, c: u8, lowercase_only: bool) -> bool {
        if self.prefix & 0x80 != 0 {
            let tree = &*HUFFMAN_TREE;
            let mut last_bit = 8i32;
            for b in (0..8).rev() {
                let bit = (c >> b) & 1 == 1;
                self.ptr = if bit {
                    tree[self.ptr].right as usize
                } else {
                    tree[self.ptr].left as usize
                };
                let node = tree[self.ptr];
                if node.left == 0 {
                    let symbol = node.right;
                    if symbol == 256 {
                        self.error(ErrorCode::CompressionError); // EOS in data
                        return false;
                    }
                    let ch = symbol as u8;
                    if lowercase_only && ch.is_ascii_uppercase() {
                        self.error(ErrorCode::ProtocolError);
                        return false;
                    }
                    self.buffer.push(ch);
                    self.ptr = 0;
                    last_bit = b;
                }
            }
            if self.int == 1 {
                // Final byte: padding must be all ones and shorter than 8.
                let mask = (1u16 << last_bit) as u16 - 1;
                if mask == 0xff || (c as u16 & mask) != mask {
                    self.error(ErrorCode::CompressionError);
                    return false;
                }
            }
        } else {
            if lowercase_only && c.is_ascii_uppercase() {
                self.error(ErrorCode::ProtocolError);
                return false;
            }
            self.buffer.push(c);
        }
        self.int -= 1;
        self.int == 0
    }

    fn add_field(&mut self, name: &str, value: &str) -> bool {
        let head = match self.head.as_mut() {
            Some(h) => h,
            None => return false,
        };
        if name.starts_with(':') {
            if self.is_trailer || self.pseudo_end {
                self.error(ErrorCode::ProtocolError);
                return false;
            }
            if self.is_response {
                if name == ":status" {
                    head.status = value.parse().ok();
                } else {
                    self.error(ErrorCode::ProtocolError);
                    return false;
                }
            } else {
                let slot = match name {
                    ":method" => &mut head.method,
                    ":scheme" => &mut head.scheme,
                    ":authority" => {
                        head.authority = Some(value.to_string());
                        return true;
                    }
                    ":path" => &mut head.path,
                    _ => {
                        self.error(ErrorCode::ProtocolError);
                        return false;
                    }
                };
                if slot.is_some() {
                    self.error(ErrorCode::ProtocolError);
                    return false;
                }
                *slot = Some(value.to_string());
            }
        } else {
            match name {
                "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
                | "upgrade" => {
                    self.error(ErrorCode::ProtocolError);
                    return false;
                }
                "te" if value != "trailers" => {
                    self.error(ErrorCode::ProtocolError);
                    return false;
                }
                "content-length" => {
                    self.content_length = value.parse().ok();
                }
                _ => {}
            }
            head.headers.push(name, value);
            self.pseudo_end = true;
        }
        true
    }
}

/// Result of decoding a complete header block.
#[derive(Debug)]
pub enum HeaderBlock {
    Head(MessageHead),
    Trailers(Headers),
}

/// HPACK encoder: static-table indexing plus literals, never inserting into
/// the dynamic table. Pseudo-headers go first; connection-specific fields
/// are dropped.
pub struct HeaderEncoder;

impl HeaderEncoder {
    /// Whether the head is a request or a response follows from the head
    /// itself; `is_trailer` suppresses the pseudo-header line.
    pub fn encode(is_trailer: bool, head: &MessageHead, out: &mut Data) {
        let mut has_authority = false;
        let headers = match head {
            MessageHead::Response(h) => {
                if !is_trailer {
                    Self::field(out, ":status", &h.status.to_string());
                }
                &h.headers
            }
            MessageHead::Request(h) => {
                if !is_trailer {
                    let scheme = h.scheme.as_deref().filter(|s| !s.is_empty()).unwrap_or("http");
                    let path = if h.path.is_empty() { "/" } else { &h.path };
                    let method = if h.method.is_empty() { "GET" } else { &h.method };
                    Self::field(out, ":method", method);
                    Self::field(out, ":scheme", scheme);
                    Self::field(out, ":path", path);
                    if let Some(authority) = h.authority.as_deref().filter(|s| !s.is_empty()) {
                        Self::field(out, ":authority", authority);
                        has_authority = true;
                    }
                }
                &h.headers
            }
            _ => return,
        };
        for (k, v) in headers.iter() {
            let name = k.to_ascii_lowercase();
            match name.as_str() {
                "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
                | "upgrade" => continue,
                "host" => {
                    if has_authority {
                        continue;
                    }
                    Self::field(out, ":authority", v);
                    continue;
                }
                _ => {}
            }
            Self::field(out, &name, v);
        }
    }

    pub fn encode_trailers(trailers: &Headers, out: &mut Data) {
        for (k, v) in trailers.iter() {
            Self::field(out, &k.to_ascii_lowercase(), v);
        }
    }

    fn field(out: &mut Data, name: &str, value: &str) {
        if let Some(entry) = ENCODER_TABLE.get(name) {
            if let Some((_, idx)) = entry.values.iter().find(|(v, _)| *v == value) {
                Self::int(out, 0x80, 1, *idx as u32);
                return;
            }
            Self::int(out, 0x00, 4, entry.index as u32);
            Self::str(out, value);
        } else {
            Self::int(out, 0x00, 4, 0);
            Self::str(out, name);
            Self::str(out, value);
        }
    }

    fn int(out: &mut Data, prefix: u8, prefix_len: u32, mut n: u32) {
        let mask = (1u32 << (8 - prefix_len)) - 1;
        if n < mask {
            out.push_u8(prefix | n as u8);
        } else {
            out.push_u8(prefix | mask as u8);
            n -= mask;
            loop {
                if n >> 7 != 0 {
                    out.push_u8(0x80 | (n & 0x7f) as u8);
                } else {
                    out.push_u8((n & 0x7f) as u8);
                }
                n >>= 7;
                if n == 0 {
                    break;
                }
            }
        }
    }

    fn str(out: &mut Data, s: &str) {
        Self::int(out, 0, 1, s.len() as u32);
        out.push_slice(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_block(decoder: &mut HeaderDecoder, is_response: bool, bytes: &[u8]) -> Result<HeaderBlock, ErrorCode> {
        decoder.start(is_response, false);
        decoder.decode(&Data::from_slice(bytes))?;
        decoder.end()
    }

    fn request_head() -> MessageHead {
        let mut head = RequestHead::default();
        head.method = "GET".to_string();
        head.path = "/".to_string();
        head.scheme = Some("http".to_string());
        head.authority = Some("x".to_string());
        head.headers.push("user-agent", "sluice");
        MessageHead::Request(head)
    }

    #[test]
    fn test_round_trip_request() {
        let mut block = Data::new();
        HeaderEncoder::encode(false, &request_head(), &mut block);

        let mut decoder = HeaderDecoder::new(4096);
        let decoded = decode_block(&mut decoder, false, &block.to_vec()).unwrap();
        match decoded {
            HeaderBlock::Head(MessageHead::Request(h)) => {
                assert_eq!(h.method, "GET");
                assert_eq!(h.path, "/");
                assert_eq!(h.scheme.as_deref(), Some("http"));
                assert_eq!(h.authority.as_deref(), Some("x"));
                assert_eq!(h.headers.get("user-agent"), Some("sluice"));
                // :authority materializes a host header.
                assert_eq!(h.headers.get("host"), Some("x"));
            }
            _ => panic!("expected request head"),
        }
    }

    #[test]
    fn test_round_trip_response() {
        let mut head = ResponseHead::default();
        head.status = 404;
        head.headers.push("content-type", "text/plain");
        let mut block = Data::new();
        HeaderEncoder::encode(false, &MessageHead::Response(head), &mut block);

        let mut decoder = HeaderDecoder::new(4096);
        match decode_block(&mut decoder, true, &block.to_vec()).unwrap() {
            HeaderBlock::Head(MessageHead::Response(h)) => {
                assert_eq!(h.status, 404);
                assert_eq!(h.headers.get("content-type"), Some("text/plain"));
            }
            _ => panic!("expected response head"),
        }
    }

    #[test]
    fn test_static_indexed_fields_are_compact() {
        // :method GET and :path / are fully indexed: one byte each.
        let mut head = RequestHead::default();
        head.scheme = Some("http".to_string());
        let mut block = Data::new();
        HeaderEncoder::encode(false, &MessageHead::Request(head), &mut block);
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn test_uppercase_name_rejected() {
        // Literal with new name "Bad" (uppercase B), no huffman.
        let mut bytes = vec![0x00];
        bytes.push(3);
        bytes.extend_from_slice(b"Bad");
        bytes.push(1);
        bytes.push(b'x');

        let mut decoder = HeaderDecoder::new(4096);
        let err = decode_block(&mut decoder, false, &bytes).unwrap_err();
        assert_eq!(err, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_connection_header_rejected() {
        let mut bytes = Data::new();
        HeaderEncoder::int(&mut bytes, 0x00, 4, 0);
        HeaderEncoder::str(&mut bytes, "connection");
        HeaderEncoder::str(&mut bytes, "close");

        let mut decoder = HeaderDecoder::new(4096);
        let err = decode_block(&mut decoder, false, &bytes.to_vec()).unwrap_err();
        assert_eq!(err, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_te_only_allows_trailers() {
        let mut bytes = Data::new();
        HeaderEncoder::int(&mut bytes, 0x00, 4, 0);
        HeaderEncoder::str(&mut bytes, "te");
        HeaderEncoder::str(&mut bytes, "gzip");

        let mut decoder = HeaderDecoder::new(4096);
        let err = decode_block(&mut decoder, false, &bytes.to_vec()).unwrap_err();
        assert_eq!(err, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_pseudo_header_after_regular_rejected() {
        let mut bytes = Data::new();
        // user-agent first, then :method.
        HeaderEncoder::int(&mut bytes, 0x00, 4, 0);
        HeaderEncoder::str(&mut bytes, "user-agent");
        HeaderEncoder::str(&mut bytes, "x");
        HeaderEncoder::int(&mut bytes, 0x80, 1, 2); // :method GET

        let mut decoder = HeaderDecoder::new(4096);
        let err = decode_block(&mut decoder, false, &bytes.to_vec()).unwrap_err();
        assert_eq!(err, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_missing_pseudo_headers_rejected() {
        let mut bytes = Data::new();
        HeaderEncoder::int(&mut bytes, 0x80, 1, 2); // only :method GET

        let mut decoder = HeaderDecoder::new(4096);
        let err = decode_block(&mut decoder, false, &bytes.to_vec()).unwrap_err();
        assert_eq!(err, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_dynamic_table_insert_and_reference() {
        // Literal with incremental indexing, then an indexed reference to the
        // new entry (index 62). Pseudo-headers must come first.
        let mut decoder = HeaderDecoder::new(4096);
        decoder.start(false, false);
        let mut ordered = Data::new();
        HeaderEncoder::int(&mut ordered, 0x80, 1, 2);
        HeaderEncoder::int(&mut ordered, 0x80, 1, 6);
        HeaderEncoder::int(&mut ordered, 0x80, 1, 4);
        HeaderEncoder::int(&mut ordered, 0x40, 2, 0);
        HeaderEncoder::str(&mut ordered, "x-custom");
        HeaderEncoder::str(&mut ordered, "1");
        HeaderEncoder::int(&mut ordered, 0x80, 1, 62); // dynamic reference
        decoder.decode(&ordered).unwrap();
        match decoder.end().unwrap() {
            HeaderBlock::Head(MessageHead::Request(h)) => {
                let customs: Vec<_> = h
                    .headers
                    .iter()
                    .filter(|(k, _)| *k == "x-custom")
                    .collect();
                assert_eq!(customs.len(), 2);
            }
            _ => panic!("expected request head"),
        }
    }

    #[test]
    fn test_huffman_decoding() {
        // "www.example.com" huffman-encoded (RFC 7541 C.4.1).
        let encoded: &[u8] = &[
            0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff,
        ];
        let mut bytes = Data::new();
        // :method GET, :scheme http, :path /, then :authority (index 1) with
        // huffman value.
        HeaderEncoder::int(&mut bytes, 0x80, 1, 2);
        HeaderEncoder::int(&mut bytes, 0x80, 1, 6);
        HeaderEncoder::int(&mut bytes, 0x80, 1, 4);
        HeaderEncoder::int(&mut bytes, 0x00, 4, 1);
        bytes.push_u8(0x80 | encoded.len() as u8);
        bytes.push_slice(encoded);

        let mut decoder = HeaderDecoder::new(4096);
        decoder.start(false, false);
        decoder.decode(&bytes).unwrap();
        match decoder.end().unwrap() {
            HeaderBlock::Head(MessageHead::Request(h)) => {
                assert_eq!(h.authority.as_deref(), Some("www.example.com"));
            }
            _ => panic!("expected request head"),
        }
    }

    #[test]
    fn test_incomplete_block_rejected() {
        let mut bytes = Data::new();
        HeaderEncoder::int(&mut bytes, 0x00, 4, 0);
        HeaderEncoder::str(&mut bytes, "x");
        // value never arrives

        let mut decoder = HeaderDecoder::new(4096);
        decoder.start(false, false);
        decoder.decode(&bytes).unwrap();
        assert_eq!(decoder.end().unwrap_err(), ErrorCode::CompressionError);
    }

    #[test]
    fn test_table_size_update_over_limit_rejected() {
        let mut bytes = Data::new();
        HeaderEncoder::int(&mut bytes, 0x20, 3, 100_000);

        let mut decoder = HeaderDecoder::new(4096);
        let err = decode_block(&mut decoder, false, &bytes.to_vec()).unwrap_err();
        assert_eq!(err, ErrorCode::CompressionError);
    }
}
