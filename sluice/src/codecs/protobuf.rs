//! Protocol Buffers wire format: varint (0), 64-bit (1), length-delimited
//! (2) and 32-bit (5) wire types, with zig-zag encoding for the signed
//! sint32/sint64 interpretations. A message is an ordered record list with
//! typed accessors layered on top.

use crate::data::{Data, Reader};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WireType {
    Varint = 0,
    I64 = 1,
    Len = 2,
    I32 = 5,
}

#[derive(Debug, Clone, PartialEq)]
enum RecordValue {
    Varint(u64),
    I64(u64),
    Len(Vec<u8>),
    I32(u32),
}

#[derive(Debug, Clone, PartialEq)]
struct Record {
    field: u32,
    value: RecordValue,
}

/// A decoded (or under-construction) protobuf message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    records: Vec<Record>,
}

fn zigzag32(n: i32) -> u64 {
    (((n << 1) ^ (n >> 31)) as u32) as u64
}

fn zigzag64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag32(n: u64) -> i32 {
    let n = n as u32;
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

fn unzigzag64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

fn read_varint(r: &mut Reader) -> Option<u64> {
    let mut n = 0u64;
    let mut shift = 0;
    loop {
        let c = r.get()?;
        n |= ((c & 0x7f) as u64) << shift;
        if c & 0x80 == 0 {
            return Some(n);
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
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

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    /// Parses a message from wire bytes. Unknown fields are preserved as
    /// records.
    pub fn decode(data: &Data) -> Option<Message> {
        let mut r = data.reader();
        let mut records = Vec::new();
        while r.remaining() > 0 {
            let key = read_varint(&mut r)?;
            let field = (key >> 3) as u32;
            if field == 0 {
                return None;
            }
            let value = match key & 0x7 {
                0 => RecordValue::Varint(read_varint(&mut r)?),
                1 => {
                    let mut buf = [0u8; 8];
                    if !r.read_exact(&mut buf) {
                        return None;
                    }
                    RecordValue::I64(u64::from_le_bytes(buf))
                }
                2 => {
                    let len = read_varint(&mut r)? as usize;
                    let mut buf = vec![0u8; len];
                    if !r.read_exact(&mut buf) {
                        return None;
                    }
                    RecordValue::Len(buf)
                }
                5 => {
                    let mut buf = [0u8; 4];
                    if !r.read_exact(&mut buf) {
                        return None;
                    }
                    RecordValue::I32(u32::from_le_bytes(buf))
                }
                _ => return None,
            };
            records.push(Record { field, value });
        }
        Some(Message { records })
    }

    pub fn encode(&self, out: &mut Data) {
        for rec in &self.records {
            let wire = match &rec.value {
                RecordValue::Varint(_) => 0u64,
                RecordValue::I64(_) => 1,
                RecordValue::Len(_) => 2,
                RecordValue::I32(_) => 5,
            };
            write_varint(out, ((rec.field as u64) << 3) | wire);
            match &rec.value {
                RecordValue::Varint(n) => write_varint(out, *n),
                RecordValue::I64(n) => out.push_slice(&n.to_le_bytes()),
                RecordValue::Len(b) => {
                    write_varint(out, b.len() as u64);
                    out.push_slice(b);
                }
                RecordValue::I32(n) => out.push_slice(&n.to_le_bytes()),
            }
        }
    }

    pub fn wire_type(&self, field: u32) -> Option<WireType> {
        self.records
            .iter()
            .rev()
            .find(|r| r.field == field)
            .map(|r| match &r.value {
                RecordValue::Varint(_) => WireType::Varint,
                RecordValue::I64(_) => WireType::I64,
                RecordValue::Len(_) => WireType::Len,
                RecordValue::I32(_) => WireType::I32,
            })
    }

    fn last_varint(&self, field: u32) -> Option<u64> {
        self.records.iter().rev().find_map(|r| match (&r.value, r.field == field) {
            (RecordValue::Varint(n), true) => Some(*n),
            _ => None,
        })
    }

    fn last_len(&self, field: u32) -> Option<&[u8]> {
        self.records.iter().rev().find_map(|r| match (&r.value, r.field == field) {
            (RecordValue::Len(b), true) => Some(b.as_slice()),
            _ => None,
        })
    }

    // scalar getters; the last record wins, matching proto semantics

    pub fn get_int32(&self, field: u32) -> Option<i32> {
        self.last_varint(field).map(|n| n as i32)
    }

    pub fn get_int64(&self, field: u32) -> Option<i64> {
        self.last_varint(field).map(|n| n as i64)
    }

    pub fn get_uint32(&self, field: u32) -> Option<u32> {
        self.last_varint(field).map(|n| n as u32)
    }

    pub fn get_uint64(&self, field: u32) -> Option<u64> {
        self.last_varint(field)
    }

    pub fn get_sint32(&self, field: u32) -> Option<i32> {
        self.last_varint(field).map(unzigzag32)
    }

    pub fn get_sint64(&self, field: u32) -> Option<i64> {
        self.last_varint(field).map(unzigzag64)
    }

    pub fn get_bool(&self, field: u32) -> Option<bool> {
        self.last_varint(field).map(|n| n != 0)
    }

    pub fn get_fixed32(&self, field: u32) -> Option<u32> {
        self.records.iter().rev().find_map(|r| match (&r.value, r.field == field) {
            (RecordValue::I32(n), true) => Some(*n),
            _ => None,
        })
    }

    pub fn get_fixed64(&self, field: u32) -> Option<u64> {
        self.records.iter().rev().find_map(|r| match (&r.value, r.field == field) {
            (RecordValue::I64(n), true) => Some(*n),
            _ => None,
        })
    }

    pub fn get_float(&self, field: u32) -> Option<f32> {
        self.get_fixed32(field).map(f32::from_bits)
    }

    pub fn get_double(&self, field: u32) -> Option<f64> {
        self.get_fixed64(field).map(f64::from_bits)
    }

    pub fn get_string(&self, field: u32) -> Option<String> {
        self.last_len(field)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn get_bytes(&self, field: u32) -> Option<Vec<u8>> {
        self.last_len(field).map(|b| b.to_vec())
    }

    pub fn get_message(&self, field: u32) -> Option<Message> {
        self.last_len(field)
            .and_then(|b| Message::decode(&Data::from_slice(b)))
    }

    /// Every value of a repeated field, in wire order.
    pub fn get_int32_array(&self, field: u32) -> Vec<i32> {
        self.records
            .iter()
            .filter(|r| r.field == field)
            .filter_map(|r| match &r.value {
                RecordValue::Varint(n) => Some(*n as i32),
                _ => None,
            })
            .collect()
    }

    pub fn get_string_array(&self, field: u32) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.field == field)
            .filter_map(|r| match &r.value {
                RecordValue::Len(b) => Some(String::from_utf8_lossy(b).into_owned()),
                _ => None,
            })
            .collect()
    }

    // setters append records

    pub fn set_int32(&mut self, field: u32, value: i32) -> &mut Message {
        self.push(field, RecordValue::Varint(value as i64 as u64))
    }

    pub fn set_int64(&mut self, field: u32, value: i64) -> &mut Message {
        self.push(field, RecordValue::Varint(value as u64))
    }

    pub fn set_uint32(&mut self, field: u32, value: u32) -> &mut Message {
        self.push(field, RecordValue::Varint(value as u64))
    }

    pub fn set_uint64(&mut self, field: u32, value: u64) -> &mut Message {
        self.push(field, RecordValue::Varint(value))
    }

    pub fn set_sint32(&mut self, field: u32, value: i32) -> &mut Message {
        self.push(field, RecordValue::Varint(zigzag32(value)))
    }

    pub fn set_sint64(&mut self, field: u32, value: i64) -> &mut Message {
        self.push(field, RecordValue::Varint(zigzag64(value)))
    }

    pub fn set_bool(&mut self, field: u32, value: bool) -> &mut Message {
        self.push(field, RecordValue::Varint(value as u64))
    }

    pub fn set_fixed32(&mut self, field: u32, value: u32) -> &mut Message {
        self.push(field, RecordValue::I32(value))
    }

    pub fn set_fixed64(&mut self, field: u32, value: u64) -> &mut Message {
        self.push(field, RecordValue::I64(value))
    }

    pub fn set_float(&mut self, field: u32, value: f32) -> &mut Message {
        self.push(field, RecordValue::I32(value.to_bits()))
    }

    pub fn set_double(&mut self, field: u32, value: f64) -> &mut Message {
        self.push(field, RecordValue::I64(value.to_bits()))
    }

    pub fn set_string(&mut self, field: u32, value: &str) -> &mut Message {
        self.push(field, RecordValue::Len(value.as_bytes().to_vec()))
    }

    pub fn set_bytes(&mut self, field: u32, value: &[u8]) -> &mut Message {
        self.push(field, RecordValue::Len(value.to_vec()))
    }

    pub fn set_message(&mut self, field: u32, value: &Message) -> &mut Message {
        let mut buf = Data::new();
        value.encode(&mut buf);
        self.push(field, RecordValue::Len(buf.to_vec()))
    }

    fn push(&mut self, field: u32, value: RecordValue) -> &mut Message {
        self.records.push(Record { field, value });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for n in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut out = Data::new();
            write_varint(&mut out, n);
            let mut r = out.reader();
            assert_eq!(read_varint(&mut r), Some(n));
        }
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag32(0), 0);
        assert_eq!(zigzag32(-1), 1);
        assert_eq!(zigzag32(1), 2);
        assert_eq!(zigzag32(-2), 3);
        assert_eq!(unzigzag32(zigzag32(i32::MIN)), i32::MIN);
        assert_eq!(unzigzag64(zigzag64(i64::MIN)), i64::MIN);
    }

    #[test]
    fn test_message_round_trip() {
        let mut inner = Message::new();
        inner.set_string(1, "nested");

        let mut msg = Message::new();
        msg.set_int32(1, -5)
            .set_sint32(2, -5)
            .set_uint64(3, 1 << 40)
            .set_bool(4, true)
            .set_fixed32(5, 0xdead_beef)
            .set_double(6, 2.5)
            .set_string(7, "hello")
            .set_bytes(8, &[1, 2, 3])
            .set_message(9, &inner);

        let mut wire = Data::new();
        msg.encode(&mut wire);
        let got = Message::decode(&wire).unwrap();

        assert_eq!(got.get_int32(1), Some(-5));
        assert_eq!(got.get_sint32(2), Some(-5));
        assert_eq!(got.get_uint64(3), Some(1 << 40));
        assert_eq!(got.get_bool(4), Some(true));
        assert_eq!(got.get_fixed32(5), Some(0xdead_beef));
        assert_eq!(got.get_double(6), Some(2.5));
        assert_eq!(got.get_string(7).as_deref(), Some("hello"));
        assert_eq!(got.get_bytes(8).as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(
            got.get_message(9).unwrap().get_string(1).as_deref(),
            Some("nested")
        );
        assert_eq!(got, msg);
    }

    #[test]
    fn test_sint_wire_size() {
        // sint32 keeps small negatives small; int32 does not.
        let mut as_sint = Message::new();
        as_sint.set_sint32(1, -1);
        let mut sint_wire = Data::new();
        as_sint.encode(&mut sint_wire);
        assert_eq!(sint_wire.len(), 2);

        let mut as_int = Message::new();
        as_int.set_int32(1, -1);
        let mut int_wire = Data::new();
        as_int.encode(&mut int_wire);
        assert_eq!(int_wire.len(), 11);
    }

    #[test]
    fn test_repeated_fields() {
        let mut msg = Message::new();
        msg.set_int32(4, 1).set_int32(4, 2).set_int32(4, 3);
        let mut wire = Data::new();
        msg.encode(&mut wire);
        let got = Message::decode(&wire).unwrap();
        assert_eq!(got.get_int32_array(4), vec![1, 2, 3]);
        // Scalar read takes the last value.
        assert_eq!(got.get_int32(4), Some(3));
    }

    #[test]
    fn test_truncated_rejected() {
        // Length-delimited field claiming more bytes than present.
        let bytes = [0x0a, 0x05, b'a', b'b'];
        assert!(Message::decode(&Data::from_slice(&bytes)).is_none());
    }

    #[test]
    fn test_unknown_wire_type_rejected() {
        let bytes = [0x0b];
        assert!(Message::decode(&Data::from_slice(&bytes)).is_none());
    }

    #[test]
    fn test_field_zero_rejected() {
        let bytes = [0x00, 0x01];
        assert!(Message::decode(&Data::from_slice(&bytes)).is_none());
    }
}
