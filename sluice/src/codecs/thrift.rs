use byteorder::{BigEndian, ByteOrder};

use crate::data::{Data, Reader};
use crate::deframer::{Deframe, Deframer, Input, ReadCmd, STATE_ERROR};
use crate::event::{ErrorKind, Event, MessageHead};
use crate::pipeline::{Filter, FilterCtx};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Protocol {
    Binary,
    OldBinary,
    Compact,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl MessageType {
    fn from_code(code: u8) -> Option<MessageType> {
        Some(match code {
            1 => MessageType::Call,
            2 => MessageType::Reply,
            3 => MessageType::Exception,
            4 => MessageType::Oneway,
            _ => return None,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Type {
    Bool,
    I8,
    I16,
    I32,
    I64,
    Double,
    Binary,
    Struct,
    Map,
    Set,
    List,
    Uuid,
}

/// Wire type codes per protocol family. Order matches the `Type` enum.
static TYPE_CODES: &[(Type, u8, u8)] = &[
    // (type, binary code, compact code)
    (Type::Bool, 2, 2),
    (Type::I8, 3, 3),
    (Type::I16, 6, 4),
    (Type::I32, 8, 5),
    (Type::I64, 10, 6),
    (Type::Double, 4, 7),
    (Type::Binary, 11, 8),
    (Type::Struct, 12, 12),
    (Type::Map, 13, 11),
    (Type::Set, 14, 10),
    (Type::List, 15, 9),
    (Type::Uuid, 16, 13),
];

fn type_code(protocol: Protocol, t: Type) -> u8 {
    let entry = TYPE_CODES
        .iter()
        .find(|(ty, _, _)| *ty == t)
        .expect("every type is in the table");
    match protocol {
        Protocol::Compact => entry.2,
        _ => entry.1,
    }
}

fn code_type(protocol: Protocol, code: u8) -> Option<Type> {
    TYPE_CODES
        .iter()
        .find(|(_, b, c)| match protocol {
            Protocol::Compact => *c == code,
            _ => *b == code,
        })
        .map(|(t, _, _)| *t)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Double(f64),
    Binary(Vec<u8>),
    Struct(Vec<Field>),
    Map {
        key_type: Type,
        value_type: Type,
        pairs: Vec<(Value, Value)>,
    },
    Set {
        element_type: Type,
        elements: Vec<Value>,
    },
    List {
        element_type: Type,
        elements: Vec<Value>,
    },
    Uuid([u8; 16]),
}

impl Value {
    fn wire_type(&self) -> Type {
        match self {
            Value::Bool(_) => Type::Bool,
            Value::I8(_) => Type::I8,
            Value::I16(_) => Type::I16,
            Value::I32(_) => Type::I32,
            Value::I64(_) => Type::I64,
            Value::Double(_) => Type::Double,
            Value::Binary(_) => Type::Binary,
            Value::Struct(_) => Type::Struct,
            Value::Map { .. } => Type::Map,
            Value::Set { .. } => Type::Set,
            Value::List { .. } => Type::List,
            Value::Uuid(_) => Type::Uuid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: i16,
    pub value: Value,
}

/// Thrift message head: protocol flavor, call kind, method name, sequence
/// id.
#[derive(Debug, Clone, PartialEq)]
pub struct ThriftHead {
    pub protocol: Protocol,
    pub message_type: MessageType,
    pub name: String,
    pub seq_id: i32,
}

fn zigzag32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

fn zigzag64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

fn unzigzag64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

enum Parse<T> {
    Done(T),
    NeedMore,
    Bad,
}

macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Parse::NeedMore,
        }
    };
}

fn read_varint(r: &mut Reader) -> Parse<u64> {
    let mut n = 0u64;
    let mut shift = 0;
    loop {
        let c = need!(r.get());
        n |= ((c & 0x7f) as u64) << shift;
        shift += 7;
        if c & 0x80 == 0 {
            return Parse::Done(n);
        }
        if shift > 63 {
            return Parse::Bad;
        }
    }
}

macro_rules! parsed {
    ($e:expr) => {
        match $e {
            Parse::Done(v) => v,
            Parse::NeedMore => return Parse::NeedMore,
            Parse::Bad => return Parse::Bad,
        }
    };
}

fn read_value(r: &mut Reader, protocol: Protocol, t: Type, depth: usize) -> Parse<Value> {
    if depth > 64 {
        return Parse::Bad;
    }
    let compact = protocol == Protocol::Compact;
    Parse::Done(match t {
        Type::Bool => Value::Bool(need!(r.get()) != 0),
        Type::I8 => Value::I8(need!(r.get()) as i8),
        Type::I16 => {
            if compact {
                Value::I16(unzigzag32(parsed!(read_varint(r)) as u32) as i16)
            } else {
                Value::I16(need!(r.read_u16()) as i16)
            }
        }
        Type::I32 => {
            if compact {
                Value::I32(unzigzag32(parsed!(read_varint(r)) as u32))
            } else {
                Value::I32(need!(r.read_u32()) as i32)
            }
        }
        Type::I64 => {
            if compact {
                Value::I64(unzigzag64(parsed!(read_varint(r))))
            } else {
                Value::I64(need!(r.read_u64()) as i64)
            }
        }
        Type::Double => Value::Double(f64::from_bits(need!(r.read_u64()))),
        Type::Binary => {
            let len = if compact {
                parsed!(read_varint(r)) as usize
            } else {
                need!(r.read_u32()) as usize
            };
            if len > 0x7fff_ffff {
                return Parse::Bad;
            }
            let mut buf = vec![0u8; len];
            if !r.read_exact(&mut buf) {
                return Parse::NeedMore;
            }
            Value::Binary(buf)
        }
        Type::Struct => {
            let mut fields = Vec::new();
            let mut last_id: i16 = 0;
            loop {
                let head = need!(r.get());
                if head == 0 {
                    break;
                }
                let (id, ftype, bool_value) = if compact {
                    let code = head & 0x0f;
                    let delta = (head >> 4) & 0x0f;
                    let id = if delta > 0 {
                        last_id + delta as i16
                    } else {
                        unzigzag32(parsed!(read_varint(r)) as u32) as i16
                    };
                    // Compact booleans fold the value into the type code.
                    match code {
                        1 => (id, Type::Bool, Some(true)),
                        2 => (id, Type::Bool, Some(false)),
                        _ => match code_type(protocol, code) {
                            Some(t) => (id, t, None),
                            None => return Parse::Bad,
                        },
                    }
                } else {
                    let id = need!(r.read_u16()) as i16;
                    match code_type(protocol, head) {
                        Some(t) => (id, t, None),
                        None => return Parse::Bad,
                    }
                };
                last_id = id;
                let value = match bool_value {
                    Some(b) => Value::Bool(b),
                    None => parsed!(read_value(r, protocol, ftype, depth + 1)),
                };
                fields.push(Field { id, value });
            }
            Value::Struct(fields)
        }
        Type::Map => {
            if compact {
                let size = parsed!(read_varint(r)) as usize;
                if size == 0 {
                    // An empty compact map is the single size byte.
                    Value::Map {
                        key_type: Type::Bool,
                        value_type: Type::Bool,
                        pairs: Vec::new(),
                    }
                } else {
                    let kv = need!(r.get());
                    let key_type = match code_type(protocol, kv >> 4) {
                        Some(t) => t,
                        None => return Parse::Bad,
                    };
                    let value_type = match code_type(protocol, kv & 0x0f) {
                        Some(t) => t,
                        None => return Parse::Bad,
                    };
                    let mut pairs = Vec::new();
                    for _ in 0..size {
                        let k = parsed!(read_value(r, protocol, key_type, depth + 1));
                        let v = parsed!(read_value(r, protocol, value_type, depth + 1));
                        pairs.push((k, v));
                    }
                    Value::Map {
                        key_type,
                        value_type,
                        pairs,
                    }
                }
            } else {
                let kt = need!(r.get());
                let vt = need!(r.get());
                let size = need!(r.read_u32()) as usize;
                let key_type = match code_type(protocol, kt) {
                    Some(t) => t,
                    None => return Parse::Bad,
                };
                let value_type = match code_type(protocol, vt) {
                    Some(t) => t,
                    None => return Parse::Bad,
                };
                let mut pairs = Vec::new();
                for _ in 0..size {
                    let k = parsed!(read_value(r, protocol, key_type, depth + 1));
                    let v = parsed!(read_value(r, protocol, value_type, depth + 1));
                    pairs.push((k, v));
                }
                Value::Map {
                    key_type,
                    value_type,
                    pairs,
                }
            }
        }
        Type::Set | Type::List => {
            let (element_type, size) = if compact {
                let head = need!(r.get());
                let code = head & 0x0f;
                let short = (head >> 4) & 0x0f;
                let size = if short == 0x0f {
                    parsed!(read_varint(r)) as usize
                } else {
                    short as usize
                };
                match code_type(protocol, code) {
                    Some(t) => (t, size),
                    None => return Parse::Bad,
                }
            } else {
                let code = need!(r.get());
                let size = need!(r.read_u32()) as usize;
                match code_type(protocol, code) {
                    Some(t) => (t, size),
                    None => return Parse::Bad,
                }
            };
            let mut elements = Vec::new();
            for _ in 0..size {
                elements.push(parsed!(read_value(r, protocol, element_type, depth + 1)));
            }
            if t == Type::Set {
                Value::Set {
                    element_type,
                    elements,
                }
            } else {
                Value::List {
                    element_type,
                    elements,
                }
            }
        }
        Type::Uuid => {
            let mut buf = [0u8; 16];
            if !r.read_exact(&mut buf) {
                return Parse::NeedMore;
            }
            Value::Uuid(buf)
        }
    })
}

fn read_head(r: &mut Reader) -> Parse<ThriftHead> {
    let first = need!(r.get());
    if first == 0x80 {
        // Strict binary: 1vvvvvvv vvvvvvvv unused 00000mmm.
        if need!(r.get()) != 0x01 {
            return Parse::Bad;
        }
        let _unused = need!(r.get());
        let mtype = match MessageType::from_code(need!(r.get()) & 0x07) {
            Some(t) => t,
            None => return Parse::Bad,
        };
        let len = need!(r.read_u32()) as usize;
        let mut name = vec![0u8; len];
        if !r.read_exact(&mut name) {
            return Parse::NeedMore;
        }
        let seq_id = need!(r.read_u32()) as i32;
        Parse::Done(ThriftHead {
            protocol: Protocol::Binary,
            message_type: mtype,
            name: String::from_utf8_lossy(&name).into_owned(),
            seq_id,
        })
    } else if first == 0x82 {
        // Compact: pppppppp mmmvvvvv, then seq id, then name.
        let second = need!(r.get());
        if second & 0x1f != 1 {
            return Parse::Bad;
        }
        let mtype = match MessageType::from_code(second >> 5) {
            Some(t) => t,
            None => return Parse::Bad,
        };
        let seq_id = parsed!(read_varint(r)) as i32;
        let len = parsed!(read_varint(r)) as usize;
        let mut name = vec![0u8; len];
        if !r.read_exact(&mut name) {
            return Parse::NeedMore;
        }
        Parse::Done(ThriftHead {
            protocol: Protocol::Compact,
            message_type: mtype,
            name: String::from_utf8_lossy(&name).into_owned(),
            seq_id,
        })
    } else if first & 0x80 != 0 {
        Parse::Bad
    } else {
        // Old binary: name length first, no version.
        let len = (((first as u32) << 24)
            | ((need!(r.get()) as u32) << 16)
            | ((need!(r.get()) as u32) << 8)
            | need!(r.get()) as u32) as usize;
        if len > 0x00ff_ffff {
            return Parse::Bad;
        }
        let mut name = vec![0u8; len];
        if !r.read_exact(&mut name) {
            return Parse::NeedMore;
        }
        let mtype = match MessageType::from_code(need!(r.get()) & 0x07) {
            Some(t) => t,
            None => return Parse::Bad,
        };
        let seq_id = need!(r.read_u32()) as i32;
        Parse::Done(ThriftHead {
            protocol: Protocol::OldBinary,
            message_type: mtype,
            name: String::from_utf8_lossy(&name).into_owned(),
            seq_id,
        })
    }
}

/// A parsed message: head plus the root struct of arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ThriftMessage {
    pub head: ThriftHead,
    pub fields: Vec<Field>,
}

/// Parses one message from the front of `data`. Returns the message and the
/// bytes consumed.
pub fn decode_message(data: &Data) -> Result<Option<(ThriftMessage, usize)>, ()> {
    let mut r = data.reader();
    let head = match read_head(&mut r) {
        Parse::Done(h) => h,
        Parse::NeedMore => return Ok(None),
        Parse::Bad => return Err(()),
    };
    let body = match read_value(&mut r, head.protocol, Type::Struct, 0) {
        Parse::Done(Value::Struct(fields)) => fields,
        Parse::Done(_) => return Err(()),
        Parse::NeedMore => return Ok(None),
        Parse::Bad => return Err(()),
    };
    Ok(Some((
        ThriftMessage {
            head,
            fields: body,
        },
        r.position(),
    )))
}

fn write_varint(out: &mut Data, mut n: u64) {
    loop {
        let mut b = (n & 0x7f) as u8;
        n >>= 7;
        if n > 0 {
            b |= 0x80;
        }
        out.push_u8(b);
        if n == 0 {
            break;
        }
    }
}

pub fn encode_value(out: &mut Data, protocol: Protocol, value: &Value) {
    let compact = protocol == Protocol::Compact;
    match value {
        Value::Bool(b) => out.push_u8(if *b { 1 } else { 0 }),
        Value::I8(n) => out.push_u8(*n as u8),
        Value::I16(n) => {
            if compact {
                write_varint(out, zigzag32(*n as i32) as u64);
            } else {
                out.push_slice(&n.to_be_bytes());
            }
        }
        Value::I32(n) => {
            if compact {
                write_varint(out, zigzag32(*n) as u64);
            } else {
                out.push_slice(&n.to_be_bytes());
            }
        }
        Value::I64(n) => {
            if compact {
                write_varint(out, zigzag64(*n));
            } else {
                out.push_slice(&n.to_be_bytes());
            }
        }
        Value::Double(d) => out.push_slice(&d.to_bits().to_be_bytes()),
        Value::Binary(b) => {
            if compact {
                write_varint(out, b.len() as u64);
            } else {
                out.push_slice(&(b.len() as u32).to_be_bytes());
            }
            out.push_slice(b);
        }
        Value::Struct(fields) => {
            let mut last_id: i16 = 0;
            for f in fields {
                let t = f.value.wire_type();
                if compact {
                    let code = match (&f.value, t) {
                        (Value::Bool(true), Type::Bool) => 1,
                        (Value::Bool(false), Type::Bool) => 2,
                        _ => type_code(protocol, t),
                    };
                    let delta = f.id as i32 - last_id as i32;
                    if (1..=15).contains(&delta) {
                        out.push_u8(((delta as u8) << 4) | code);
                    } else {
                        out.push_u8(code);
                        write_varint(out, zigzag32(f.id as i32) as u64);
                    }
                    if t != Type::Bool {
                        encode_value(out, protocol, &f.value);
                    }
                    last_id = f.id;
                } else {
                    out.push_u8(type_code(protocol, t));
                    out.push_slice(&f.id.to_be_bytes());
                    encode_value(out, protocol, &f.value);
                }
            }
            out.push_u8(0);
        }
        Value::Map {
            key_type,
            value_type,
            pairs,
        } => {
            let kt = type_code(protocol, *key_type);
            let vt = type_code(protocol, *value_type);
            if compact {
                if pairs.is_empty() {
                    out.push_u8(0);
                } else {
                    write_varint(out, pairs.len() as u64);
                    out.push_u8((kt << 4) | (vt & 0x0f));
                }
            } else {
                out.push_u8(kt);
                out.push_u8(vt);
                out.push_slice(&(pairs.len() as u32).to_be_bytes());
            }
            for (k, v) in pairs {
                encode_value(out, protocol, k);
                encode_value(out, protocol, v);
            }
        }
        Value::Set {
            element_type,
            elements,
        }
        | Value::List {
            element_type,
            elements,
        } => {
            let t = type_code(protocol, *element_type);
            if compact {
                if elements.len() <= 14 {
                    out.push_u8(((elements.len() as u8) << 4) | (t & 0x0f));
                } else {
                    out.push_u8(0xf0 | (t & 0x0f));
                    write_varint(out, elements.len() as u64);
                }
            } else {
                out.push_u8(t);
                out.push_slice(&(elements.len() as u32).to_be_bytes());
            }
            for e in elements {
                encode_value(out, protocol, e);
            }
        }
        Value::Uuid(bytes) => out.push_slice(bytes),
    }
}

pub fn encode_message(msg: &ThriftMessage) -> Data {
    let mut out = Data::new();
    let head = &msg.head;
    match head.protocol {
        Protocol::Binary => {
            out.push_slice(&[0x80, 0x01, 0x00, head.message_type as u8]);
            out.push_slice(&(head.name.len() as u32).to_be_bytes());
            out.push_slice(head.name.as_bytes());
            out.push_slice(&head.seq_id.to_be_bytes());
        }
        Protocol::Compact => {
            out.push_u8(0x82);
            out.push_u8(0x01 | ((head.message_type as u8) << 5));
            write_varint(&mut out, head.seq_id as u32 as u64);
            write_varint(&mut out, head.name.len() as u64);
            out.push_slice(head.name.as_bytes());
        }
        Protocol::OldBinary => {
            out.push_slice(&(head.name.len() as u32).to_be_bytes());
            out.push_slice(head.name.as_bytes());
            out.push_u8(head.message_type as u8);
            out.push_slice(&head.seq_id.to_be_bytes());
        }
    }
    encode_value(&mut out, head.protocol, &Value::Struct(msg.fields.clone()));
    out
}

// ---- streaming decoder ----

const STATE_START: i32 = 0;
const STATE_BINARY_HEAD: i32 = 1;
const STATE_COMPACT_HEAD: i32 = 2;
const STATE_OLD_HEAD: i32 = 3;
const STATE_NAME: i32 = 4;
const STATE_NAME_LEN_VAR: i32 = 5;
const STATE_OLD_TYPE: i32 = 6;
const STATE_SEQ4: i32 = 7;
const STATE_SEQ_VAR: i32 = 8;
const STATE_FIELD_HEAD: i32 = 9;
const STATE_FIELD_ID2: i32 = 10;
const STATE_FIELD_ID_VAR: i32 = 11;
const STATE_VALUE_BYTE: i32 = 12;
const STATE_VALUE_FIXED: i32 = 13;
const STATE_VALUE_VARINT: i32 = 14;
const STATE_BIN_LEN4: i32 = 15;
const STATE_BIN_LEN_VAR: i32 = 16;
const STATE_BIN_BODY: i32 = 17;
const STATE_MAP_HEAD6: i32 = 18;
const STATE_MAP_SIZE_VAR: i32 = 19;
const STATE_MAP_KV: i32 = 20;
const STATE_LIST_HEAD5: i32 = 21;
const STATE_LIST_HEAD_C: i32 = 22;
const STATE_LIST_SIZE_VAR: i32 = 23;

const MAX_NESTING: usize = 64;

/// What the tokenizer is inside of while walking the argument struct.
enum Level {
    Struct,
    List {
        etype: Type,
        remaining: usize,
    },
    Map {
        ktype: Type,
        vtype: Type,
        pairs_left: usize,
        on_key: bool,
    },
}

struct DecoderInner {
    protocol: Protocol,
    message_type: MessageType,
    name: String,
    seq_id: i32,
    name_len_first: u8,
    var_int: u64,
    var_shift: u32,
    stack: Vec<Level>,
    pending_type: Type,
    pending_folded: bool,
    map_size: usize,
    body: Data,
    in_body: bool,
    error: bool,
}

impl DecoderInner {
    fn new() -> DecoderInner {
        DecoderInner {
            protocol: Protocol::Binary,
            message_type: MessageType::Call,
            name: String::new(),
            seq_id: 0,
            name_len_first: 0,
            var_int: 0,
            var_shift: 0,
            stack: Vec::new(),
            pending_type: Type::Bool,
            pending_folded: false,
            map_size: 0,
            body: Data::new(),
            in_body: false,
            error: false,
        }
    }

    fn fail(&mut self, out: &mut dyn FnMut(Event)) -> i32 {
        self.error = true;
        out(Event::stream_end(Some(ErrorKind::ProtocolError)));
        STATE_ERROR
    }

    /// One byte of a varint; `Some` once the final octet lands. Overflow
    /// saturates and is rejected by the callers' range checks.
    fn varint_step(&mut self, c: u8) -> Option<u64> {
        self.var_int |= ((c & 0x7f) as u64) << self.var_shift.min(63);
        self.var_shift += 7;
        if c & 0x80 != 0 && self.var_shift <= 63 {
            return None;
        }
        let n = if self.var_shift > 63 {
            u64::MAX
        } else {
            self.var_int
        };
        self.var_int = 0;
        self.var_shift = 0;
        Some(n)
    }

    fn flush_body(&mut self, out: &mut dyn FnMut(Event)) {
        if !self.body.is_empty() {
            out(Event::Data(self.body.take_all()));
        }
    }

    fn after_name(&mut self, cmd: &mut ReadCmd, out: &mut dyn FnMut(Event)) -> i32 {
        match self.protocol {
            Protocol::Binary => {
                cmd.fill(4);
                STATE_SEQ4
            }
            Protocol::OldBinary => STATE_OLD_TYPE,
            Protocol::Compact => self.begin_message(out),
        }
    }

    fn begin_message(&mut self, out: &mut dyn FnMut(Event)) -> i32 {
        let head = ThriftHead {
            protocol: self.protocol,
            message_type: self.message_type,
            name: std::mem::take(&mut self.name),
            seq_id: self.seq_id,
        };
        out(Event::message_start(Some(MessageHead::Thrift(head))));
        self.in_body = true;
        self.stack.push(Level::Struct);
        STATE_FIELD_HEAD
    }

    fn finish_message(&mut self, out: &mut dyn FnMut(Event)) -> i32 {
        self.flush_body(out);
        out(Event::message_end(None));
        self.in_body = false;
        STATE_START
    }

    /// Arms the read for one value of type `t` and returns the state that
    /// consumes it. Containers push a level and recurse through `end_value`.
    fn begin_value(&mut self, t: Type, cmd: &mut ReadCmd, out: &mut dyn FnMut(Event)) -> i32 {
        if self.stack.len() > MAX_NESTING {
            return self.fail(out);
        }
        let compact = self.protocol == Protocol::Compact;
        match t {
            Type::Bool | Type::I8 => STATE_VALUE_BYTE,
            Type::I16 | Type::I32 | Type::I64 => {
                if compact {
                    STATE_VALUE_VARINT
                } else {
                    cmd.fill(match t {
                        Type::I16 => 2,
                        Type::I32 => 4,
                        _ => 8,
                    });
                    STATE_VALUE_FIXED
                }
            }
            Type::Double => {
                cmd.fill(8);
                STATE_VALUE_FIXED
            }
            Type::Uuid => {
                cmd.fill(16);
                STATE_VALUE_FIXED
            }
            Type::Binary => {
                if compact {
                    STATE_BIN_LEN_VAR
                } else {
                    cmd.fill(4);
                    STATE_BIN_LEN4
                }
            }
            Type::Struct => {
                self.stack.push(Level::Struct);
                STATE_FIELD_HEAD
            }
            Type::Map => {
                if compact {
                    STATE_MAP_SIZE_VAR
                } else {
                    cmd.fill(6);
                    STATE_MAP_HEAD6
                }
            }
            Type::Set | Type::List => {
                if compact {
                    STATE_LIST_HEAD_C
                } else {
                    cmd.fill(5);
                    STATE_LIST_HEAD5
                }
            }
        }
    }

    /// A value just finished; the enclosing level decides what comes next.
    fn end_value(&mut self, cmd: &mut ReadCmd, out: &mut dyn FnMut(Event)) -> i32 {
        loop {
            match self.stack.last_mut() {
                None => return self.finish_message(out),
                Some(Level::Struct) => return STATE_FIELD_HEAD,
                Some(Level::List { etype, remaining }) => {
                    if *remaining == 0 {
                        self.stack.pop();
                        continue;
                    }
                    *remaining -= 1;
                    let t = *etype;
                    return self.begin_value(t, cmd, out);
                }
                Some(Level::Map {
                    ktype,
                    vtype,
                    pairs_left,
                    on_key,
                }) => {
                    if *pairs_left == 0 {
                        self.stack.pop();
                        continue;
                    }
                    if *on_key {
                        // The key just completed; its value follows.
                        *on_key = false;
                        let t = *vtype;
                        return self.begin_value(t, cmd, out);
                    }
                    *pairs_left -= 1;
                    if *pairs_left == 0 {
                        self.stack.pop();
                        continue;
                    }
                    *on_key = true;
                    let t = *ktype;
                    return self.begin_value(t, cmd, out);
                }
            }
        }
    }

    /// Starts a just-parsed list/set level; empty collections complete
    /// immediately.
    fn enter_list(
        &mut self,
        etype: Type,
        size: usize,
        cmd: &mut ReadCmd,
        out: &mut dyn FnMut(Event),
    ) -> i32 {
        if size > 0x7fff_ffff {
            return self.fail(out);
        }
        if size == 0 {
            return self.end_value(cmd, out);
        }
        self.stack.push(Level::List {
            etype,
            remaining: size,
        });
        self.end_value(cmd, out)
    }

    fn enter_map(
        &mut self,
        ktype: Type,
        vtype: Type,
        pairs: usize,
        cmd: &mut ReadCmd,
        out: &mut dyn FnMut(Event),
    ) -> i32 {
        if pairs > 0x7fff_ffff {
            return self.fail(out);
        }
        if pairs == 0 {
            return self.end_value(cmd, out);
        }
        self.stack.push(Level::Map {
            ktype,
            vtype,
            pairs_left: pairs,
            on_key: true,
        });
        self.begin_value(ktype, cmd, out)
    }
}

impl Deframe for DecoderInner {
    fn on_state(
        &mut self,
        state: i32,
        input: Input,
        cmd: &mut ReadCmd,
        out: &mut dyn FnMut(Event),
    ) -> i32 {
        // Body bytes pass through downstream; structural bytes consumed by
        // scan and fill modes are collected here, bulk payloads flow via
        // `on_pass`.
        if self.in_body {
            match &input {
                Input::Byte(c) => self.body.push_u8(*c),
                Input::Filled(b) => self.body.push_slice(b),
                Input::FilledData(_) => {}
            }
        }
        match (state, input) {
            (STATE_START, Input::Byte(c)) => {
                if c == 0x80 {
                    self.protocol = Protocol::Binary;
                    cmd.fill(7);
                    STATE_BINARY_HEAD
                } else if c == 0x82 {
                    self.protocol = Protocol::Compact;
                    cmd.fill(1);
                    STATE_COMPACT_HEAD
                } else if c & 0x80 != 0 {
                    self.fail(out)
                } else {
                    self.protocol = Protocol::OldBinary;
                    self.name_len_first = c;
                    cmd.fill(3);
                    STATE_OLD_HEAD
                }
            }
            (STATE_BINARY_HEAD, Input::Filled(buf)) => {
                // version low byte, unused, type, 4-byte name length
                if buf[0] != 0x01 {
                    return self.fail(out);
                }
                self.message_type = match MessageType::from_code(buf[2] & 0x07) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                let len = BigEndian::read_u32(&buf[3..7]) as usize;
                if len > 0x00ff_ffff {
                    return self.fail(out);
                }
                if len == 0 {
                    self.name.clear();
                    self.after_name(cmd, out)
                } else {
                    cmd.fill_data(len);
                    STATE_NAME
                }
            }
            (STATE_COMPACT_HEAD, Input::Filled(buf)) => {
                if buf[0] & 0x1f != 1 {
                    return self.fail(out);
                }
                self.message_type = match MessageType::from_code(buf[0] >> 5) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                STATE_SEQ_VAR
            }
            (STATE_OLD_HEAD, Input::Filled(buf)) => {
                let len = (((self.name_len_first as u32) << 24)
                    | ((buf[0] as u32) << 16)
                    | ((buf[1] as u32) << 8)
                    | buf[2] as u32) as usize;
                if len > 0x00ff_ffff {
                    return self.fail(out);
                }
                if len == 0 {
                    self.name.clear();
                    self.after_name(cmd, out)
                } else {
                    cmd.fill_data(len);
                    STATE_NAME
                }
            }
            (STATE_NAME, Input::FilledData(data)) => {
                self.name = data.to_string_lossy();
                self.after_name(cmd, out)
            }
            (STATE_NAME_LEN_VAR, Input::Byte(c)) => match self.varint_step(c) {
                Some(len) => {
                    let len = len as usize;
                    if len > 0x00ff_ffff {
                        return self.fail(out);
                    }
                    if len == 0 {
                        self.name.clear();
                        self.after_name(cmd, out)
                    } else {
                        cmd.fill_data(len);
                        STATE_NAME
                    }
                }
                None => STATE_NAME_LEN_VAR,
            },
            (STATE_OLD_TYPE, Input::Byte(c)) => {
                self.message_type = match MessageType::from_code(c & 0x07) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                cmd.fill(4);
                STATE_SEQ4
            }
            (STATE_SEQ4, Input::Filled(buf)) => {
                self.seq_id = BigEndian::read_u32(&buf[0..4]) as i32;
                self.begin_message(out)
            }
            (STATE_SEQ_VAR, Input::Byte(c)) => match self.varint_step(c) {
                Some(n) => {
                    self.seq_id = n as i32;
                    STATE_NAME_LEN_VAR
                }
                None => STATE_SEQ_VAR,
            },
            (STATE_FIELD_HEAD, Input::Byte(c)) => {
                if c == 0 {
                    // stop field: the enclosing struct is complete
                    self.stack.pop();
                    return self.end_value(cmd, out);
                }
                if self.protocol == Protocol::Compact {
                    let code = c & 0x0f;
                    let delta = (c >> 4) & 0x0f;
                    let (ftype, folded) = match code {
                        1 | 2 => (Type::Bool, true),
                        _ => match code_type(self.protocol, code) {
                            Some(t) => (t, false),
                            None => return self.fail(out),
                        },
                    };
                    self.pending_type = ftype;
                    self.pending_folded = folded;
                    if delta > 0 {
                        if folded {
                            self.end_value(cmd, out)
                        } else {
                            self.begin_value(ftype, cmd, out)
                        }
                    } else {
                        STATE_FIELD_ID_VAR
                    }
                } else {
                    self.pending_type = match code_type(self.protocol, c) {
                        Some(t) => t,
                        None => return self.fail(out),
                    };
                    cmd.fill(2);
                    STATE_FIELD_ID2
                }
            }
            (STATE_FIELD_ID2, Input::Filled(_)) => {
                let t = self.pending_type;
                self.begin_value(t, cmd, out)
            }
            (STATE_FIELD_ID_VAR, Input::Byte(c)) => match self.varint_step(c) {
                Some(_) => {
                    if self.pending_folded {
                        self.end_value(cmd, out)
                    } else {
                        let t = self.pending_type;
                        self.begin_value(t, cmd, out)
                    }
                }
                None => STATE_FIELD_ID_VAR,
            },
            (STATE_VALUE_BYTE, Input::Byte(_)) => self.end_value(cmd, out),
            (STATE_VALUE_FIXED, Input::Filled(_)) => self.end_value(cmd, out),
            (STATE_VALUE_VARINT, Input::Byte(c)) => match self.varint_step(c) {
                Some(_) => self.end_value(cmd, out),
                None => STATE_VALUE_VARINT,
            },
            (STATE_BIN_LEN4, Input::Filled(buf)) => {
                let len = BigEndian::read_u32(&buf[0..4]) as usize;
                if len > 0x7fff_ffff {
                    return self.fail(out);
                }
                if len == 0 {
                    self.end_value(cmd, out)
                } else {
                    cmd.pass(len);
                    STATE_BIN_BODY
                }
            }
            (STATE_BIN_LEN_VAR, Input::Byte(c)) => match self.varint_step(c) {
                Some(len) => {
                    let len = len as usize;
                    if len > 0x7fff_ffff {
                        return self.fail(out);
                    }
                    if len == 0 {
                        self.end_value(cmd, out)
                    } else {
                        cmd.pass(len);
                        STATE_BIN_BODY
                    }
                }
                None => STATE_BIN_LEN_VAR,
            },
            (STATE_BIN_BODY, Input::Filled(_)) => self.end_value(cmd, out),
            (STATE_MAP_HEAD6, Input::Filled(buf)) => {
                let ktype = match code_type(self.protocol, buf[0]) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                let vtype = match code_type(self.protocol, buf[1]) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                let size = BigEndian::read_u32(&buf[2..6]) as usize;
                self.enter_map(ktype, vtype, size, cmd, out)
            }
            (STATE_MAP_SIZE_VAR, Input::Byte(c)) => match self.varint_step(c) {
                Some(size) => {
                    if size == 0 {
                        // An empty compact map is just its size byte.
                        self.end_value(cmd, out)
                    } else {
                        self.map_size = size as usize;
                        STATE_MAP_KV
                    }
                }
                None => STATE_MAP_SIZE_VAR,
            },
            (STATE_MAP_KV, Input::Byte(c)) => {
                let ktype = match code_type(self.protocol, c >> 4) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                let vtype = match code_type(self.protocol, c & 0x0f) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                let size = self.map_size;
                self.enter_map(ktype, vtype, size, cmd, out)
            }
            (STATE_LIST_HEAD5, Input::Filled(buf)) => {
                let etype = match code_type(self.protocol, buf[0]) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                let size = BigEndian::read_u32(&buf[1..5]) as usize;
                self.enter_list(etype, size, cmd, out)
            }
            (STATE_LIST_HEAD_C, Input::Byte(c)) => {
                let etype = match code_type(self.protocol, c & 0x0f) {
                    Some(t) => t,
                    None => return self.fail(out),
                };
                let short = (c >> 4) & 0x0f;
                if short == 0x0f {
                    self.pending_type = etype;
                    STATE_LIST_SIZE_VAR
                } else {
                    self.enter_list(etype, short as usize, cmd, out)
                }
            }
            (STATE_LIST_SIZE_VAR, Input::Byte(c)) => match self.varint_step(c) {
                Some(size) => {
                    let t = self.pending_type;
                    self.enter_list(t, size as usize, cmd, out)
                }
                None => STATE_LIST_SIZE_VAR,
            },
            _ => self.fail(out),
        }
    }

    /// Bulk binary payloads flow straight through; buffered structural bytes
    /// go first so the body stays in wire order.
    fn on_pass(&mut self, data: Data, out: &mut dyn FnMut(Event)) {
        self.flush_body(out);
        out(Event::Data(data));
    }
}

/// Thrift decoder filter: frames messages on the deframer, emits the head on
/// `MessageStart` and the argument-struct bytes as the body, with BINARY
/// field payloads passed through without inspection.
pub struct Decoder {
    deframer: Deframer,
    inner: DecoderInner,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            deframer: Deframer::new(STATE_START),
            inner: DecoderInner::new(),
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
                if !self.inner.error {
                    if self.deframer.state() != STATE_START || self.deframer.is_mid_frame() {
                        out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                    } else {
                        out(Event::StreamEnd(eos));
                    }
                }
                self.reset();
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.deframer.reset(STATE_START);
        self.inner = DecoderInner::new();
    }
}

/// Thrift encoder filter: head plus body bytes back onto the wire. When the
/// body is empty the head's fields (none) still produce the stop byte.
pub struct Encoder {
    head: Option<ThriftHead>,
    buffer: Data,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            head: None,
            buffer: Data::new(),
        }
    }
}

impl Filter for Encoder {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::MessageStart(start) => {
                self.head = match start.head {
                    Some(MessageHead::Thrift(h)) => Some(h),
                    _ => None,
                };
                self.buffer.clear();
            }
            Event::Data(data) => {
                if self.head.is_some() {
                    self.buffer.push(data);
                }
            }
            Event::MessageEnd(_) => {
                if let Some(head) = self.head.take() {
                    let msg = ThriftMessage {
                        head,
                        fields: Vec::new(),
                    };
                    let mut wire = encode_message(&msg);
                    if !self.buffer.is_empty() {
                        // Replace the empty struct with the supplied body.
                        wire.pop(1);
                        wire.push(self.buffer.take_all());
                    }
                    out(Event::Data(wire));
                }
            }
            Event::StreamEnd(eos) => {
                self.head = None;
                self.buffer.clear();
                out(Event::StreamEnd(eos));
            }
        }
    }

    fn reset(&mut self) {
        self.head = None;
        self.buffer.clear();
    }
}
