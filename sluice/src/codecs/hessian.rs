//! Hessian 2.0 value codec, following the tag dispatch of the serialization
//! grammar: compact integers, longs, doubles, dates, chunked strings and
//! binaries, typed and untyped lists and maps, and class-definition-based
//! objects. The class-definition table is bounded to stop adversarial
//! streams from growing it without limit.

use crate::data::{Data, Reader};

/// Upper bound on recorded class definitions per parser lifetime.
pub const MAX_CLASS_DEFS: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    /// Milliseconds since the epoch.
    Date(i64),
    String(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Object {
        type_name: String,
        fields: Vec<(String, Value)>,
    },
}

#[derive(Debug, Clone)]
struct ClassDef {
    type_name: String,
    field_names: Vec<String>,
}

/// Stateful decoder; class definitions accumulate across values, capped at
/// `MAX_CLASS_DEFS`.
pub struct Parser {
    class_defs: Vec<ClassDef>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum ParseError {
    Truncated,
    BadTag(u8),
    TooManyClassDefs,
}

impl Parser {
    pub fn new() -> Parser {
        Parser {
            class_defs: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.class_defs.clear();
    }

    /// Decodes every value in `data`.
    pub fn parse(&mut self, data: &Data) -> Result<Vec<Value>, ParseError> {
        let mut r = data.reader();
        let mut values = Vec::new();
        while r.remaining() > 0 {
            values.push(self.value(&mut r)?);
        }
        Ok(values)
    }

    fn byte(&self, r: &mut Reader) -> Result<u8, ParseError> {
        r.get().ok_or(ParseError::Truncated)
    }

    fn take(&self, r: &mut Reader, n: usize) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0u8; n];
        if r.read_exact(&mut buf) {
            Ok(buf)
        } else {
            Err(ParseError::Truncated)
        }
    }

    fn utf8(&self, r: &mut Reader, chars: usize) -> Result<String, ParseError> {
        // Length counts characters, not bytes.
        let mut s = String::with_capacity(chars);
        for _ in 0..chars {
            let c = self.byte(r)?;
            let extra = if c < 0x80 {
                0
            } else if c & 0xe0 == 0xc0 {
                1
            } else if c & 0xf0 == 0xe0 {
                2
            } else {
                3
            };
            let mut bytes = vec![c];
            bytes.extend(self.take(r, extra)?);
            s.push_str(&String::from_utf8_lossy(&bytes));
        }
        Ok(s)
    }

    fn string_body(&self, r: &mut Reader, tag: u8) -> Result<String, ParseError> {
        match tag {
            0x00..=0x1f => self.utf8(r, tag as usize),
            0x30..=0x33 => {
                let b1 = self.byte(r)?;
                self.utf8(r, (((tag - 0x30) as usize) << 8) + b1 as usize)
            }
            0x52 | b'S' => {
                // 'R' marks a non-final chunk followed by more string data.
                let mut s = String::new();
                let mut t = tag;
                loop {
                    let len = ((self.byte(r)? as usize) << 8) + self.byte(r)? as usize;
                    s.push_str(&self.utf8(r, len)?);
                    if t == b'S' {
                        return Ok(s);
                    }
                    t = self.byte(r)?;
                    match t {
                        0x52 | b'S' => {}
                        _ => return Err(ParseError::BadTag(t)),
                    }
                }
            }
            _ => Err(ParseError::BadTag(tag)),
        }
    }

    fn value(&mut self, r: &mut Reader) -> Result<Value, ParseError> {
        let tag = self.byte(r)?;
        self.value_tagged(r, tag)
    }

    fn value_tagged(&mut self, r: &mut Reader, tag: u8) -> Result<Value, ParseError> {
        Ok(match tag {
            b'N' => Value::Null,
            b'T' => Value::Bool(true),
            b'F' => Value::Bool(false),

            // int forms
            0x80..=0xbf => Value::Int(tag as i32 - 0x90),
            0xc0..=0xcf => {
                let b = self.byte(r)? as i32;
                Value::Int(((tag as i32 - 0xc8) << 8) + b)
            }
            0xd0..=0xd7 => {
                let b1 = self.byte(r)? as i32;
                let b0 = self.byte(r)? as i32;
                Value::Int(((tag as i32 - 0xd4) << 16) + (b1 << 8) + b0)
            }
            b'I' => {
                let b = self.take(r, 4)?;
                Value::Int(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }

            // long forms
            0xd8..=0xef => Value::Long(tag as i64 - 0xe0),
            0xf0..=0xff => {
                let b = self.byte(r)? as i64;
                Value::Long(((tag as i64 - 0xf8) << 8) + b)
            }
            0x38..=0x3f => {
                let b1 = self.byte(r)? as i64;
                let b0 = self.byte(r)? as i64;
                Value::Long(((tag as i64 - 0x3c) << 16) + (b1 << 8) + b0)
            }
            0x59 => {
                let b = self.take(r, 4)?;
                Value::Long(i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64)
            }
            b'L' => {
                let b = self.take(r, 8)?;
                Value::Long(i64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }

            // double forms
            0x5b => Value::Double(0.0),
            0x5c => Value::Double(1.0),
            0x5d => Value::Double(self.byte(r)? as i8 as f64),
            0x5e => {
                let b = self.take(r, 2)?;
                Value::Double(i16::from_be_bytes([b[0], b[1]]) as f64)
            }
            0x5f => {
                let b = self.take(r, 4)?;
                Value::Double(f32::from_bits(u32::from_be_bytes([b[0], b[1], b[2], b[3]])) as f64)
            }
            b'D' => {
                let b = self.take(r, 8)?;
                Value::Double(f64::from_bits(u64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ])))
            }

            // dates
            0x4a => {
                let b = self.take(r, 8)?;
                Value::Date(i64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            0x4b => {
                let b = self.take(r, 4)?;
                Value::Date(i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64 * 60_000)
            }

            // strings
            0x00..=0x1f | 0x30..=0x33 | 0x52 | b'S' => Value::String(self.string_body(r, tag)?),

            // binaries
            0x20..=0x2f => Value::Binary(self.take(r, tag as usize - 0x20)?),
            0x34..=0x37 => {
                let b1 = self.byte(r)?;
                let len = (((tag - 0x34) as usize) << 8) + b1 as usize;
                Value::Binary(self.take(r, len)?)
            }
            0x41 | b'B' => {
                let mut out = Vec::new();
                let mut t = tag;
                loop {
                    let len = ((self.byte(r)? as usize) << 8) + self.byte(r)? as usize;
                    out.extend(self.take(r, len)?);
                    if t == b'B' {
                        break;
                    }
                    t = self.byte(r)?;
                    match t {
                        0x41 | b'B' => {}
                        _ => return Err(ParseError::BadTag(t)),
                    }
                }
                Value::Binary(out)
            }

            // lists
            0x55 => {
                // variable-length typed list
                let _type = self.value(r)?;
                self.list_until_end(r)?
            }
            0x56 => {
                let _type = self.value(r)?;
                let n = self.int_value(r)?;
                self.list_fixed(r, n as usize)?
            }
            0x57 => self.list_until_end(r)?,
            0x58 => {
                let n = self.int_value(r)?;
                self.list_fixed(r, n as usize)?
            }
            0x70..=0x77 => {
                let _type = self.value(r)?;
                self.list_fixed(r, tag as usize - 0x70)?
            }
            0x78..=0x7f => self.list_fixed(r, tag as usize - 0x78)?,

            // maps
            b'M' => {
                let _type = self.value(r)?;
                self.map_until_end(r)?
            }
            b'H' => self.map_until_end(r)?,

            // class definition + object
            b'C' => {
                let name = match self.value(r)? {
                    Value::String(s) => s,
                    _ => return Err(ParseError::BadTag(tag)),
                };
                let count = self.int_value(r)? as usize;
                let mut field_names = Vec::with_capacity(count);
                for _ in 0..count {
                    match self.value(r)? {
                        Value::String(s) => field_names.push(s),
                        _ => return Err(ParseError::BadTag(tag)),
                    }
                }
                if self.class_defs.len() >= MAX_CLASS_DEFS {
                    return Err(ParseError::TooManyClassDefs);
                }
                self.class_defs.push(ClassDef {
                    type_name: name,
                    field_names,
                });
                // The definition is followed by the value that uses it.
                self.value(r)?
            }
            0x60..=0x6f => self.object(r, tag as usize - 0x60)?,
            b'O' => {
                let idx = self.int_value(r)? as usize;
                self.object(r, idx)?
            }

            _ => return Err(ParseError::BadTag(tag)),
        })
    }

    fn int_value(&mut self, r: &mut Reader) -> Result<i32, ParseError> {
        match self.value(r)? {
            Value::Int(n) => Ok(n),
            Value::Long(n) => Ok(n as i32),
            _ => Err(ParseError::Truncated),
        }
    }

    fn list_fixed(&mut self, r: &mut Reader, n: usize) -> Result<Value, ParseError> {
        let mut elements = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            elements.push(self.value(r)?);
        }
        Ok(Value::List(elements))
    }

    fn list_until_end(&mut self, r: &mut Reader) -> Result<Value, ParseError> {
        let mut elements = Vec::new();
        loop {
            match r.get() {
                Some(b'Z') => return Ok(Value::List(elements)),
                Some(tag) => elements.push(self.value_tagged(r, tag)?),
                None => return Err(ParseError::Truncated),
            }
        }
    }

    fn map_until_end(&mut self, r: &mut Reader) -> Result<Value, ParseError> {
        let mut pairs = Vec::new();
        loop {
            match r.get() {
                Some(b'Z') => return Ok(Value::Map(pairs)),
                Some(tag) => {
                    let k = self.value_tagged(r, tag)?;
                    let v = self.value(r)?;
                    pairs.push((k, v));
                }
                None => return Err(ParseError::Truncated),
            }
        }
    }

    fn object(&mut self, r: &mut Reader, def_index: usize) -> Result<Value, ParseError> {
        let def = self
            .class_defs
            .get(def_index)
            .cloned()
            .ok_or(ParseError::Truncated)?;
        let mut fields = Vec::with_capacity(def.field_names.len());
        for name in def.field_names {
            fields.push((name, self.value(r)?));
        }
        Ok(Value::Object {
            type_name: def.type_name,
            fields,
        })
    }

}

/// Stateful encoder; class definitions are shared across the values written
/// through one `Writer`.
pub struct Writer {
    defs: Vec<(String, Vec<String>)>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer { defs: Vec::new() }
    }

    pub fn encode(&mut self, value: &Value, out: &mut Data) {
        encode_with(self, value, out)
    }
}

/// Encodes one standalone value in Hessian 2.0 form.
pub fn encode(value: &Value, out: &mut Data) {
    Writer::new().encode(value, out)
}

fn encode_with(w: &mut Writer, value: &Value, out: &mut Data) {
    match value {
        Value::Null => out.push_u8(b'N'),
        Value::Bool(true) => out.push_u8(b'T'),
        Value::Bool(false) => out.push_u8(b'F'),
        Value::Int(n) => {
            let n = *n;
            if (-16..=47).contains(&n) {
                out.push_u8((n + 0x90) as u8);
            } else if (-2048..=2047).contains(&n) {
                out.push_u8(((n >> 8) + 0xc8) as u8);
                out.push_u8(n as u8);
            } else if (-262_144..=262_143).contains(&n) {
                out.push_u8(((n >> 16) + 0xd4) as u8);
                out.push_u8((n >> 8) as u8);
                out.push_u8(n as u8);
            } else {
                out.push_u8(b'I');
                out.push_slice(&n.to_be_bytes());
            }
        }
        Value::Long(n) => {
            let n = *n;
            if (-8..=15).contains(&n) {
                out.push_u8((n + 0xe0) as u8);
            } else if (-2048..=2047).contains(&n) {
                out.push_u8(((n >> 8) + 0xf8) as u8);
                out.push_u8(n as u8);
            } else if (-262_144..=262_143).contains(&n) {
                out.push_u8(((n >> 16) + 0x3c) as u8);
                out.push_u8((n >> 8) as u8);
                out.push_u8(n as u8);
            } else if (i32::MIN as i64..=i32::MAX as i64).contains(&n) {
                out.push_u8(0x59);
                out.push_slice(&(n as i32).to_be_bytes());
            } else {
                out.push_u8(b'L');
                out.push_slice(&n.to_be_bytes());
            }
        }
        Value::Double(d) => {
            if *d == 0.0 {
                out.push_u8(0x5b);
            } else if *d == 1.0 {
                out.push_u8(0x5c);
            } else if d.fract() == 0.0 && (-128.0..=127.0).contains(d) {
                out.push_u8(0x5d);
                out.push_u8(*d as i8 as u8);
            } else if d.fract() == 0.0 && (-32768.0..=32767.0).contains(d) {
                out.push_u8(0x5e);
                out.push_slice(&(*d as i16).to_be_bytes());
            } else {
                out.push_u8(b'D');
                out.push_slice(&d.to_bits().to_be_bytes());
            }
        }
        Value::Date(ms) => {
            if ms % 60_000 == 0 && (ms / 60_000) <= i32::MAX as i64 && (ms / 60_000) >= i32::MIN as i64
            {
                out.push_u8(0x4b);
                out.push_slice(&((ms / 60_000) as i32).to_be_bytes());
            } else {
                out.push_u8(0x4a);
                out.push_slice(&ms.to_be_bytes());
            }
        }
        Value::String(s) => {
            let chars = s.chars().count();
            if chars <= 0x1f {
                out.push_u8(chars as u8);
            } else if chars <= 0x3ff {
                out.push_u8(0x30 + (chars >> 8) as u8);
                out.push_u8(chars as u8);
            } else {
                out.push_u8(b'S');
                out.push_u8((chars >> 8) as u8);
                out.push_u8(chars as u8);
            }
            out.push_slice(s.as_bytes());
        }
        Value::Binary(b) => {
            if b.len() <= 0x0f {
                out.push_u8(0x20 + b.len() as u8);
            } else if b.len() <= 0x3ff {
                out.push_u8(0x34 + (b.len() >> 8) as u8);
                out.push_u8(b.len() as u8);
            } else {
                out.push_u8(b'B');
                out.push_u8((b.len() >> 8) as u8);
                out.push_u8(b.len() as u8);
            }
            out.push_slice(b);
        }
        Value::List(elements) => {
            if elements.len() <= 7 {
                out.push_u8(0x78 + elements.len() as u8);
            } else {
                out.push_u8(0x58);
                encode_with(w, &Value::Int(elements.len() as i32), out);
            }
            for e in elements {
                encode_with(w, e, out);
            }
        }
        Value::Map(pairs) => {
            out.push_u8(b'H');
            for (k, v) in pairs {
                encode_with(w, k, out);
                encode_with(w, v, out);
            }
            out.push_u8(b'Z');
        }
        Value::Object { type_name, fields } => {
            let names: Vec<String> = fields.iter().map(|(n, _)| n.clone()).collect();
            let idx = match w
                .defs
                .iter()
                .position(|(t, f)| t == type_name && *f == names)
            {
                Some(idx) => idx,
                None => {
                    out.push_u8(b'C');
                    encode_with(w, &Value::String(type_name.clone()), out);
                    encode_with(w, &Value::Int(names.len() as i32), out);
                    for name in &names {
                        encode_with(w, &Value::String(name.clone()), out);
                    }
                    w.defs.push((type_name.clone(), names));
                    w.defs.len() - 1
                }
            };
            if idx < 16 {
                out.push_u8(0x60 + idx as u8);
            } else {
                out.push_u8(b'O');
                encode_with(w, &Value::Int(idx as i32), out);
            }
            for (_, v) in fields {
                encode_with(w, v, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) {
        let mut wire = Data::new();
        encode(&v, &mut wire);
        let mut parser = Parser::new();
        let got = parser.parse(&wire).unwrap();
        assert_eq!(got, vec![v]);
    }

    #[test]
    fn test_scalars() {
        round_trip(Value::Null);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
    }

    #[test]
    fn test_int_forms() {
        for n in [0, 1, -16, 47, 48, -17, 2047, -2048, 262_143, -262_144, 1_000_000, i32::MIN] {
            round_trip(Value::Int(n));
        }
    }

    #[test]
    fn test_long_forms() {
        for n in [
            0i64,
            15,
            -8,
            16,
            2047,
            -2048,
            262_143,
            -262_144,
            i32::MAX as i64,
            i64::MAX,
            i64::MIN,
        ] {
            round_trip(Value::Long(n));
        }
    }

    #[test]
    fn test_doubles() {
        for d in [0.0, 1.0, 2.0, -128.0, 12.5, -3.25e10] {
            round_trip(Value::Double(d));
        }
    }

    #[test]
    fn test_dates() {
        round_trip(Value::Date(1_234_567_890_000));
        round_trip(Value::Date(60_000));
    }

    #[test]
    fn test_strings() {
        round_trip(Value::String(String::new()));
        round_trip(Value::String("hello".to_string()));
        round_trip(Value::String("x".repeat(200)));
        round_trip(Value::String("x".repeat(5000)));
    }

    #[test]
    fn test_binaries() {
        round_trip(Value::Binary(Vec::new()));
        round_trip(Value::Binary(vec![1, 2, 3]));
        round_trip(Value::Binary(vec![0xab; 2000]));
    }

    #[test]
    fn test_lists_and_maps() {
        round_trip(Value::List(vec![
            Value::Int(1),
            Value::String("two".to_string()),
            Value::List(vec![Value::Null]),
        ]));
        round_trip(Value::List((0..20).map(Value::Int).collect()));
        round_trip(Value::Map(vec![
            (Value::String("k".to_string()), Value::Int(1)),
            (Value::Int(2), Value::Bool(false)),
        ]));
    }

    #[test]
    fn test_object_with_class_def() {
        round_trip(Value::Object {
            type_name: "example.Point".to_string(),
            fields: vec![
                ("x".to_string(), Value::Int(3)),
                ("y".to_string(), Value::Int(4)),
            ],
        });
    }

    #[test]
    fn test_shared_class_defs_across_values() {
        let point = |x: i32| Value::Object {
            type_name: "example.Point".to_string(),
            fields: vec![("x".to_string(), Value::Int(x))],
        };
        let mut wire = Data::new();
        let mut writer = Writer::new();
        writer.encode(&point(1), &mut wire);
        writer.encode(&point(2), &mut wire);

        let mut parser = Parser::new();
        let got = parser.parse(&wire).unwrap();
        assert_eq!(got, vec![point(1), point(2)]);
    }

    #[test]
    fn test_class_def_table_is_bounded() {
        // A stream of class definitions beyond the cap must fail rather than
        // grow without limit.
        let mut wire = Data::new();
        let mut writer = Writer::new();
        for i in 0..(MAX_CLASS_DEFS + 1) {
            writer.encode(
                &Value::Object {
                    type_name: format!("c{}", i),
                    fields: Vec::new(),
                },
                &mut wire,
            );
        }
        let mut parser = Parser::new();
        assert_eq!(parser.parse(&wire).unwrap_err(), ParseError::TooManyClassDefs);
    }

    #[test]
    fn test_truncated_input() {
        let mut parser = Parser::new();
        assert_eq!(
            parser.parse(&Data::from_slice(&[b'I', 0, 0])).unwrap_err(),
            ParseError::Truncated
        );
    }

    #[test]
    fn test_bad_tag() {
        // 'Z' outside a list or map is not a value.
        let mut parser = Parser::new();
        assert!(matches!(
            parser.parse(&Data::from_slice(&[b'Z'])).unwrap_err(),
            ParseError::BadTag(_)
        ));
    }
}
