use crate::data::Data;
use crate::deframer::{Deframe, Deframer, Input, ReadCmd, STATE_ERROR};
use crate::event::{ErrorKind, Event, MessageHead};
use crate::pipeline::{Filter, FilterCtx};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    pub fn from_code(code: u8) -> Option<PacketType> {
        use PacketType::*;
        Some(match code {
            1 => Connect,
            2 => Connack,
            3 => Publish,
            4 => Puback,
            5 => Pubrec,
            6 => Pubrel,
            7 => Pubcomp,
            8 => Subscribe,
            9 => Suback,
            10 => Unsubscribe,
            11 => Unsuback,
            12 => Pingreq,
            13 => Pingresp,
            14 => Disconnect,
            15 => Auth,
            _ => return None,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PropType {
    VarInt,
    Int8,
    Int16,
    Int32,
    Str,
    Bin,
}

/// The fixed v5 property-id-to-type table. Id 38 (user property) is handled
/// separately as a name/value string pair.
static PROPERTIES: &[(u8, &str, PropType)] = &[
    (1, "payloadFormatIndicator", PropType::Int8),
    (2, "messageExpiryInterval", PropType::Int32),
    (3, "contentType", PropType::Str),
    (8, "responseTopic", PropType::Str),
    (9, "correlationData", PropType::Bin),
    (11, "subscriptionIdentifier", PropType::VarInt),
    (17, "sessionExpiryInterval", PropType::Int32),
    (18, "assignedClientIdentifier", PropType::Str),
    (19, "serverKeepAlive", PropType::Int16),
    (21, "authenticationMethod", PropType::Str),
    (22, "authenticationData", PropType::Bin),
    (23, "requestProblemInfo", PropType::Int8),
    (24, "willDelayInterval", PropType::Int32),
    (25, "requestResponseInfo", PropType::Int8),
    (26, "responseInfo", PropType::Str),
    (28, "serverReference", PropType::Str),
    (31, "reasonString", PropType::Str),
    (33, "receiveMaximum", PropType::Int16),
    (34, "topicAliasMaximum", PropType::Int16),
    (35, "topicAlias", PropType::Int16),
    (36, "maximumQoS", PropType::Int8),
    (37, "retainAvailable", PropType::Int8),
    (39, "maximumPacketSize", PropType::Int32),
    (40, "wildcardSubscriptionAvailable", PropType::Int8),
    (41, "subscriptionIdentifierAvailable", PropType::Int8),
    (42, "sharedSubscriptionAvailable", PropType::Int8),
];

fn property_by_id(id: u8) -> Option<&'static (u8, &'static str, PropType)> {
    PROPERTIES.iter().find(|(i, _, _)| *i == id)
}

fn property_by_name(name: &str) -> Option<&'static (u8, &'static str, PropType)> {
    PROPERTIES.iter().find(|(_, n, _)| *n == name)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int(u32),
    Str(String),
    Bin(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Will {
    pub qos: u8,
    pub retain: bool,
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: Vec<(String, PropertyValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: u8,
}

/// MQTT packet header: the fixed-header bits plus the variable-header fields
/// of whichever packet type this is.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttHead {
    pub packet_type: PacketType,
    pub dup: bool,
    pub retain: bool,
    pub qos: u8,
    pub protocol_level: u8,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub session_present: bool,
    pub reason_code: u8,
    pub packet_identifier: Option<u16>,
    pub topic_name: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    pub properties: Vec<(String, PropertyValue)>,
    pub topic_filters: Vec<TopicFilter>,
    pub reason_codes: Vec<u8>,
}

impl MqttHead {
    pub fn new(packet_type: PacketType) -> MqttHead {
        MqttHead {
            packet_type,
            dup: false,
            retain: false,
            qos: 0,
            protocol_level: 4,
            keep_alive: 0,
            clean_start: false,
            session_present: false,
            reason_code: 0,
            packet_identifier: None,
            topic_name: None,
            client_id: None,
            username: None,
            password: None,
            will: None,
            properties: Vec::new(),
            topic_filters: Vec::new(),
            reason_codes: Vec::new(),
        }
    }
}

// ---- packet body parsing ----

struct PacketParser<'a> {
    reader: crate::data::Reader<'a>,
    protocol_level: u8,
}

impl<'a> PacketParser<'a> {
    fn new(data: &'a Data, protocol_level: u8) -> PacketParser<'a> {
        PacketParser {
            reader: data.reader(),
            protocol_level,
        }
    }

    fn position(&self) -> usize {
        self.reader.position()
    }

    fn u8(&mut self) -> Option<u8> {
        self.reader.get()
    }

    fn u16(&mut self) -> Option<u16> {
        self.reader.read_u16()
    }

    fn u32(&mut self) -> Option<u32> {
        self.reader.read_u32()
    }

    fn var_int(&mut self) -> Option<u32> {
        let mut n = 0u32;
        let mut shift = 0;
        loop {
            let c = self.u8()?;
            n |= ((c & 0x7f) as u32) << shift;
            shift += 7;
            if c & 0x80 == 0 {
                return Some(n);
            }
            if shift > 28 {
                return None;
            }
        }
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u16()? as usize;
        let mut buf = vec![0u8; len];
        if !self.reader.read_exact(&mut buf) {
            return None;
        }
        Some(String::from_utf8_lossy(&buf).into_owned())
    }

    fn bytes(&mut self) -> Option<Vec<u8>> {
        let len = self.u16()? as usize;
        let mut buf = vec![0u8; len];
        if !self.reader.read_exact(&mut buf) {
            return None;
        }
        Some(buf)
    }

    fn properties(&mut self) -> Option<Vec<(String, PropertyValue)>> {
        let mut props = Vec::new();
        let size = self.var_int()? as usize;
        if size == 0 {
            return Some(props);
        }
        let start = self.position();
        while self.position() - start < size {
            let id = self.u8()?;
            if id == 38 {
                let k = self.string()?;
                let v = self.string()?;
                props.push((k, PropertyValue::Str(v)));
                continue;
            }
            let (_, name, ptype) = property_by_id(id)?;
            let value = match ptype {
                PropType::VarInt => PropertyValue::Int(self.var_int()?),
                PropType::Int8 => PropertyValue::Int(self.u8()? as u32),
                PropType::Int16 => PropertyValue::Int(self.u16()? as u32),
                PropType::Int32 => PropertyValue::Int(self.u32()?),
                PropType::Str => PropertyValue::Str(self.string()?),
                PropType::Bin => PropertyValue::Bin(self.bytes()?),
            };
            props.push((name.to_string(), value));
        }
        Some(props)
    }

    fn decode(&mut self, head: &mut MqttHead) -> Option<()> {
        let v5 = |p: &PacketParser| p.protocol_level >= 5;
        match head.packet_type {
            PacketType::Connect => {
                // Protocol name "MQTT" with its 2-byte length prefix.
                if self.u16()? != 4 {
                    return None;
                }
                let mut name = [0u8; 4];
                if !self.reader.read_exact(&mut name) || &name != b"MQTT" {
                    return None;
                }
                head.protocol_level = self.u8()?;
                self.protocol_level = head.protocol_level;
                let flags = self.u8()?;
                head.keep_alive = self.u16()?;
                if v5(self) {
                    head.properties = self.properties()?;
                }
                head.client_id = Some(self.string()?);
                head.clean_start = flags & 0x02 != 0;
                if flags & 0x04 != 0 {
                    let mut will = Will::default();
                    will.qos = (flags >> 3) & 0x03;
                    will.retain = flags & 0x20 != 0;
                    if v5(self) {
                        will.properties = self.properties()?;
                    }
                    will.topic = self.string()?;
                    will.payload = self.bytes()?;
                    head.will = Some(will);
                }
                if flags & 0x80 != 0 {
                    head.username = Some(self.string()?);
                }
                if flags & 0x40 != 0 {
                    head.password = Some(self.bytes()?);
                }
            }
            PacketType::Connack => {
                head.session_present = self.u8()? & 0x01 != 0;
                head.reason_code = self.u8()?;
                if v5(self) {
                    head.properties = self.properties()?;
                }
            }
            PacketType::Publish => {
                head.topic_name = Some(self.string()?);
                if head.qos > 0 {
                    head.packet_identifier = Some(self.u16()?);
                }
                if v5(self) {
                    head.properties = self.properties()?;
                }
            }
            PacketType::Puback | PacketType::Pubrec | PacketType::Pubrel | PacketType::Pubcomp => {
                head.packet_identifier = Some(self.u16()?);
                if v5(self) {
                    head.reason_code = self.u8().unwrap_or(0);
                    head.properties = self.properties().unwrap_or_default();
                }
            }
            PacketType::Subscribe => {
                head.packet_identifier = Some(self.u16()?);
                if v5(self) {
                    head.properties = self.properties()?;
                }
                while self.reader.remaining() > 0 {
                    let filter = self.string()?;
                    let options = self.u8()?;
                    head.topic_filters.push(TopicFilter {
                        filter,
                        qos: options & 0x03,
                    });
                }
            }
            PacketType::Suback | PacketType::Unsuback => {
                head.packet_identifier = Some(self.u16()?);
                if v5(self) {
                    head.properties = self.properties()?;
                }
                while let Some(code) = self.u8() {
                    head.reason_codes.push(code);
                }
            }
            PacketType::Unsubscribe => {
                head.packet_identifier = Some(self.u16()?);
                if v5(self) {
                    head.properties = self.properties()?;
                }
                while self.reader.remaining() > 0 {
                    let filter = self.string()?;
                    head.topic_filters.push(TopicFilter { filter, qos: 0 });
                }
            }
            PacketType::Pingreq | PacketType::Pingresp => {}
            PacketType::Disconnect | PacketType::Auth => {
                if self.reader.remaining() > 0 {
                    head.reason_code = self.u8()?;
                    if v5(self) {
                        head.properties = self.properties()?;
                    }
                }
            }
        }
        Some(())
    }
}

// ---- decoder ----

const STATE_FIXED_HEADER: i32 = 0;
const STATE_REMAINING_LENGTH: i32 = 1;
const STATE_REMAINING_DATA: i32 = 2;

struct DecoderInner {
    fixed_header: u8,
    remaining_length: u32,
    remaining_shift: u32,
    protocol_level: u8,
    error: bool,
}

impl DecoderInner {
    fn message(&mut self, buffer: Data, out: &mut dyn FnMut(Event)) -> bool {
        let code = self.fixed_header >> 4;
        let packet_type = match PacketType::from_code(code) {
            Some(t) => t,
            None => return false,
        };
        let mut head = MqttHead::new(packet_type);
        head.qos = (self.fixed_header >> 1) & 0x03;
        head.dup = self.fixed_header & 0x08 != 0;
        head.retain = self.fixed_header & 0x01 != 0;
        head.protocol_level = self.protocol_level;

        let mut parser = PacketParser::new(&buffer, self.protocol_level);
        if parser.decode(&mut head).is_none() {
            return false;
        }
        let consumed = parser.position();
        self.protocol_level = parser.protocol_level;
        let is_publish = packet_type == PacketType::Publish;

        out(Event::message_start(Some(MessageHead::Mqtt(head))));
        if is_publish {
            let mut payload = buffer;
            payload.shift(consumed);
            if !payload.is_empty() {
                out(Event::Data(payload));
            }
        }
        out(Event::message_end(None));
        true
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
        match (state, input) {
            (STATE_FIXED_HEADER, Input::Byte(c)) => {
                self.fixed_header = c;
                self.remaining_length = 0;
                self.remaining_shift = 0;
                STATE_REMAINING_LENGTH
            }
            (STATE_REMAINING_LENGTH, Input::Byte(c)) => {
                self.remaining_length |= ((c & 0x7f) as u32) << self.remaining_shift;
                self.remaining_shift += 7;
                if c & 0x80 != 0 {
                    if self.remaining_shift > 28 {
                        self.error = true;
                        out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                        return STATE_ERROR;
                    }
                    return STATE_REMAINING_LENGTH;
                }
                if self.remaining_length == 0 {
                    if !self.message(Data::new(), out) {
                        self.error = true;
                        out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                        return STATE_ERROR;
                    }
                    STATE_FIXED_HEADER
                } else {
                    cmd.fill_data(self.remaining_length as usize);
                    STATE_REMAINING_DATA
                }
            }
            (STATE_REMAINING_DATA, Input::FilledData(data)) => {
                if !self.message(data, out) {
                    self.error = true;
                    out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                    return STATE_ERROR;
                }
                STATE_FIXED_HEADER
            }
            _ => STATE_ERROR,
        }
    }
}

/// MQTT decoder: one event message per packet, PUBLISH payloads as body
/// data. The protocol level learned from CONNECT governs v5 properties on
/// every later packet.
pub struct Decoder {
    deframer: Deframer,
    inner: DecoderInner,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            deframer: Deframer::new(STATE_FIXED_HEADER),
            inner: DecoderInner {
                fixed_header: 0,
                remaining_length: 0,
                remaining_shift: 0,
                protocol_level: 4,
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
                } else {
                    out(Event::StreamEnd(eos));
                }
                self.reset();
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.deframer.reset(STATE_FIXED_HEADER);
        self.inner.protocol_level = 4;
        self.inner.error = false;
    }
}

// ---- encoder ----

struct PacketBuilder {
    buffer: Data,
    protocol_level: u8,
}

impl PacketBuilder {
    fn new(protocol_level: u8) -> PacketBuilder {
        PacketBuilder {
            buffer: Data::new(),
            protocol_level,
        }
    }

    fn u8(&mut self, c: u8) {
        self.buffer.push_u8(c);
    }

    fn u16(&mut self, n: u16) {
        self.buffer.push_slice(&n.to_be_bytes());
    }

    fn u32(&mut self, n: u32) {
        self.buffer.push_slice(&n.to_be_bytes());
    }

    fn var_int(&mut self, mut n: u32) {
        loop {
            let mut b = (n & 0x7f) as u8;
            n >>= 7;
            if n > 0 {
                b |= 0x80;
            }
            self.buffer.push_u8(b);
            if n == 0 {
                break;
            }
        }
    }

    fn string(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buffer.push_slice(s.as_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.u16(b.len() as u16);
        self.buffer.push_slice(b);
    }

    fn properties(&mut self, props: &[(String, PropertyValue)]) {
        if self.protocol_level < 5 {
            return;
        }
        let mut sub = PacketBuilder::new(self.protocol_level);
        for (name, value) in props {
            match property_by_name(name) {
                Some((id, _, ptype)) => {
                    sub.u8(*id);
                    match (ptype, value) {
                        (PropType::VarInt, PropertyValue::Int(n)) => sub.var_int(*n),
                        (PropType::Int8, PropertyValue::Int(n)) => sub.u8(*n as u8),
                        (PropType::Int16, PropertyValue::Int(n)) => sub.u16(*n as u16),
                        (PropType::Int32, PropertyValue::Int(n)) => sub.u32(*n),
                        (PropType::Str, PropertyValue::Str(s)) => sub.string(s),
                        (PropType::Bin, PropertyValue::Bin(b)) => sub.bytes(b),
                        _ => sub.u8(0),
                    }
                }
                None => {
                    // User property.
                    sub.u8(38);
                    sub.string(name);
                    match value {
                        PropertyValue::Str(s) => sub.string(s),
                        PropertyValue::Int(n) => sub.string(&n.to_string()),
                        PropertyValue::Bin(b) => {
                            sub.string(&String::from_utf8_lossy(b).into_owned())
                        }
                    }
                }
            }
        }
        self.var_int(sub.buffer.len() as u32);
        self.buffer.push(sub.buffer);
    }

    fn build(mut self, head: &MqttHead, payload: Data) -> (Data, u8) {
        let mut flags = 0u8;
        match head.packet_type {
            PacketType::Connect => {
                self.protocol_level = head.protocol_level;
                let mut cflags = 0u8;
                if head.clean_start {
                    cflags |= 0x02;
                }
                if let Some(will) = &head.will {
                    cflags |= 0x04 | ((will.qos & 0x03) << 3);
                    if will.retain {
                        cflags |= 0x20;
                    }
                }
                if head.username.is_some() {
                    cflags |= 0x80;
                }
                if head.password.is_some() {
                    cflags |= 0x40;
                }
                self.string("MQTT");
                self.u8(head.protocol_level);
                self.u8(cflags);
                self.u16(head.keep_alive);
                self.properties(&head.properties);
                self.string(head.client_id.as_deref().unwrap_or(""));
                if let Some(will) = &head.will {
                    if self.protocol_level >= 5 {
                        self.properties(&will.properties);
                    }
                    self.string(&will.topic);
                    self.bytes(&will.payload);
                }
                if let Some(username) = &head.username {
                    self.string(username);
                }
                if let Some(password) = &head.password {
                    self.bytes(password);
                }
            }
            PacketType::Connack => {
                self.u8(if head.session_present { 1 } else { 0 });
                self.u8(head.reason_code);
                self.properties(&head.properties);
            }
            PacketType::Publish => {
                flags = ((head.qos & 0x03) << 1)
                    | if head.dup { 0x08 } else { 0 }
                    | if head.retain { 0x01 } else { 0 };
                self.string(head.topic_name.as_deref().unwrap_or(""));
                if head.qos > 0 {
                    self.u16(head.packet_identifier.unwrap_or(0));
                }
                self.properties(&head.properties);
                self.buffer.push(payload);
            }
            PacketType::Puback | PacketType::Pubrec | PacketType::Pubrel | PacketType::Pubcomp => {
                if head.packet_type == PacketType::Pubrel {
                    flags = 0x02;
                }
                self.u16(head.packet_identifier.unwrap_or(0));
                if self.protocol_level >= 5 {
                    self.u8(head.reason_code);
                    self.properties(&head.properties);
                }
            }
            PacketType::Subscribe => {
                flags = 0x02;
                self.u16(head.packet_identifier.unwrap_or(0));
                self.properties(&head.properties);
                for f in &head.topic_filters {
                    self.string(&f.filter);
                    self.u8(f.qos & 0x03);
                }
            }
            PacketType::Suback | PacketType::Unsuback => {
                self.u16(head.packet_identifier.unwrap_or(0));
                self.properties(&head.properties);
                for code in &head.reason_codes {
                    self.u8(*code);
                }
            }
            PacketType::Unsubscribe => {
                flags = 0x02;
                self.u16(head.packet_identifier.unwrap_or(0));
                self.properties(&head.properties);
                for f in &head.topic_filters {
                    self.string(&f.filter);
                }
            }
            PacketType::Pingreq | PacketType::Pingresp => {}
            PacketType::Disconnect | PacketType::Auth => {
                if self.protocol_level >= 5 {
                    self.u8(head.reason_code);
                    self.properties(&head.properties);
                }
            }
        }
        let mut out = Data::new();
        out.push_u8(((head.packet_type as u8) << 4) | (flags & 0x0f));
        let mut len_builder = PacketBuilder::new(self.protocol_level);
        len_builder.var_int(self.buffer.len() as u32);
        out.push(len_builder.buffer);
        out.push(self.buffer);
        (out, self.protocol_level)
    }
}

/// MQTT encoder: message head plus any body data become one wire packet.
pub struct Encoder {
    head: Option<MqttHead>,
    buffer: Data,
    protocol_level: u8,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            head: None,
            buffer: Data::new(),
            protocol_level: 4,
        }
    }
}

impl Filter for Encoder {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::MessageStart(start) => {
                self.head = match start.head {
                    Some(MessageHead::Mqtt(h)) => Some(h),
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
                    let builder = PacketBuilder::new(self.protocol_level);
                    let payload = self.buffer.take_all();
                    let (bytes, level) = builder.build(&head, payload);
                    self.protocol_level = level;
                    out(Event::Data(bytes));
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
        self.protocol_level = 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(head: MqttHead, payload: &[u8]) -> (MqttHead, Vec<u8>) {
        let mut encoder = Encoder::new();
        let mut ctx = FilterCtx::new(None);
        let mut wire = Vec::new();
        for evt in vec![
            Event::message_start(Some(MessageHead::Mqtt(head))),
            Event::Data(Data::from_slice(payload)),
            Event::message_end(None),
        ] {
            encoder.process(&mut ctx, evt, &mut |e| {
                if let Event::Data(d) = e {
                    wire.extend_from_slice(&d.to_vec());
                }
            });
        }

        let mut decoder = Decoder::new();
        let mut got = Vec::new();
        decoder.process(&mut ctx, Event::Data(Data::from_slice(&wire)), &mut |e| {
            got.push(e)
        });

        let head = match got.first() {
            Some(Event::MessageStart(start)) => match start.head.clone() {
                Some(MessageHead::Mqtt(h)) => h,
                other => panic!("unexpected head {:?}", other),
            },
            other => panic!("unexpected event {:?}", other),
        };
        let body: Vec<u8> = got
            .iter()
            .filter_map(|e| match e {
                Event::Data(d) => Some(d.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        (head, body)
    }

    #[test]
    fn test_connect_v5_round_trip() {
        let mut head = MqttHead::new(PacketType::Connect);
        head.protocol_level = 5;
        head.keep_alive = 60;
        head.clean_start = true;
        head.client_id = Some("client-1".to_string());
        head.username = Some("user".to_string());
        head.password = Some(b"secret".to_vec());
        head.properties
            .push(("sessionExpiryInterval".to_string(), PropertyValue::Int(300)));

        let (got, _) = round_trip(head.clone(), b"");
        assert_eq!(got.packet_type, PacketType::Connect);
        assert_eq!(got.protocol_level, 5);
        assert_eq!(got.keep_alive, 60);
        assert!(got.clean_start);
        assert_eq!(got.client_id.as_deref(), Some("client-1"));
        assert_eq!(got.username.as_deref(), Some("user"));
        assert_eq!(got.password.as_deref(), Some(&b"secret"[..]));
        assert_eq!(got.properties, head.properties);
    }

    #[test]
    fn test_connect_with_will() {
        let mut head = MqttHead::new(PacketType::Connect);
        head.protocol_level = 4;
        head.client_id = Some("c".to_string());
        head.will = Some(Will {
            qos: 1,
            retain: true,
            topic: "last".to_string(),
            payload: b"gone".to_vec(),
            properties: Vec::new(),
        });

        let (got, _) = round_trip(head, b"");
        let will = got.will.expect("will decoded");
        assert_eq!(will.qos, 1);
        assert!(will.retain);
        assert_eq!(will.topic, "last");
        assert_eq!(will.payload, b"gone");
    }

    #[test]
    fn test_publish_round_trip_with_payload() {
        let mut head = MqttHead::new(PacketType::Publish);
        head.qos = 1;
        head.dup = true;
        head.topic_name = Some("a/b".to_string());
        head.packet_identifier = Some(99);

        let (got, body) = round_trip(head, b"sensor-data");
        assert_eq!(got.packet_type, PacketType::Publish);
        assert_eq!(got.qos, 1);
        assert!(got.dup);
        assert_eq!(got.topic_name.as_deref(), Some("a/b"));
        assert_eq!(got.packet_identifier, Some(99));
        assert_eq!(body, b"sensor-data");
    }

    #[test]
    fn test_subscribe_round_trip() {
        let mut head = MqttHead::new(PacketType::Subscribe);
        head.packet_identifier = Some(7);
        head.topic_filters.push(TopicFilter {
            filter: "x/#".to_string(),
            qos: 2,
        });
        head.topic_filters.push(TopicFilter {
            filter: "y/+".to_string(),
            qos: 0,
        });

        let (got, _) = round_trip(head.clone(), b"");
        assert_eq!(got.packet_identifier, Some(7));
        assert_eq!(got.topic_filters, head.topic_filters);
    }

    #[test]
    fn test_suback_reason_codes() {
        let mut head = MqttHead::new(PacketType::Suback);
        head.packet_identifier = Some(7);
        head.reason_codes = vec![0, 1, 0x80];

        let (got, _) = round_trip(head, b"");
        assert_eq!(got.reason_codes, vec![0, 1, 0x80]);
    }

    #[test]
    fn test_pingreq_zero_length() {
        let head = MqttHead::new(PacketType::Pingreq);
        let (got, _) = round_trip(head, b"");
        assert_eq!(got.packet_type, PacketType::Pingreq);
    }

    #[test]
    fn test_remaining_length_multi_byte() {
        // A payload long enough to need a two-byte remaining length.
        let mut head = MqttHead::new(PacketType::Publish);
        head.topic_name = Some("t".to_string());
        let payload = vec![0x42u8; 300];
        let (got, body) = round_trip(head, &payload);
        assert_eq!(got.topic_name.as_deref(), Some("t"));
        assert_eq!(body, payload);
    }

    #[test]
    fn test_v5_properties_follow_connect_level() {
        let mut ctx = FilterCtx::new(None);
        let mut encoder = Encoder::new();
        let mut wire = Vec::new();

        let mut connect = MqttHead::new(PacketType::Connect);
        connect.protocol_level = 5;
        connect.client_id = Some("c".to_string());
        let mut disconnect = MqttHead::new(PacketType::Disconnect);
        disconnect.reason_code = 4;
        disconnect
            .properties
            .push(("reasonString".to_string(), PropertyValue::Str("bye".into())));

        for head in vec![connect, disconnect] {
            for evt in vec![
                Event::message_start(Some(MessageHead::Mqtt(head))),
                Event::message_end(None),
            ] {
                encoder.process(&mut ctx, evt, &mut |e| {
                    if let Event::Data(d) = e {
                        wire.extend_from_slice(&d.to_vec());
                    }
                });
            }
        }

        let mut decoder = Decoder::new();
        let mut got = Vec::new();
        decoder.process(&mut ctx, Event::Data(Data::from_slice(&wire)), &mut |e| {
            got.push(e)
        });
        let heads: Vec<MqttHead> = got
            .iter()
            .filter_map(|e| match e {
                Event::MessageStart(s) => match s.head.clone() {
                    Some(MessageHead::Mqtt(h)) => Some(h),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[1].reason_code, 4);
        assert_eq!(
            heads[1].properties,
            vec![("reasonString".to_string(), PropertyValue::Str("bye".into()))]
        );
    }

    #[test]
    fn test_truncated_packet_is_protocol_error() {
        let mut decoder = Decoder::new();
        let mut ctx = FilterCtx::new(None);
        let mut got = Vec::new();
        // CONNECT claiming 10 remaining bytes, but only garbage follows.
        decoder.process(
            &mut ctx,
            Event::Data(Data::from_slice(&[0x10, 0x0a, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff])),
            &mut |e| got.push(e),
        );
        assert!(matches!(
            got.last(),
            Some(Event::StreamEnd(e)) if e.error == Some(ErrorKind::ProtocolError)
        ));
    }
}
