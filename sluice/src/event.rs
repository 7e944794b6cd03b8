use crate::data::Data;

/// Error kinds carried on a `StreamEnd`. These travel down the pipeline in
/// place of exceptions; filters never fail across the filter boundary.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    ReadTimeout,
    WriteTimeout,
    IdleTimeout,
    ReadError,
    WriteError,
    ConnectionRefused,
    ConnectionReset,
    ConnectionCanceled,
    BufferOverflow,
    ProtocolError,
    UnauthorizedError,
    InternalError,
}

/// The unit of communication between filters.
///
/// Per logical stream the sequence matches
/// `(MessageStart Data* MessageEnd)* StreamEnd?`: no `Data` outside a started
/// message, and a `StreamEnd` is terminal.
#[derive(Debug, Clone)]
pub enum Event {
    MessageStart(MessageStart),
    Data(Data),
    MessageEnd(MessageEnd),
    StreamEnd(StreamEnd),
}

impl Event {
    #[inline]
    pub fn message_start(head: Option<MessageHead>) -> Event {
        Event::MessageStart(MessageStart { head })
    }

    #[inline]
    pub fn message_end(tail: Option<MessageTail>) -> Event {
        Event::MessageEnd(MessageEnd { tail })
    }

    #[inline]
    pub fn stream_end(error: Option<ErrorKind>) -> Event {
        Event::StreamEnd(StreamEnd { error })
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        match self {
            Event::MessageEnd(_) | Event::StreamEnd(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageStart {
    pub head: Option<MessageHead>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageEnd {
    pub tail: Option<MessageTail>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamEnd {
    pub error: Option<ErrorKind>,
}

/// Ordered multi-valued header map shared by the HTTP heads. Names compare
/// case-insensitively but are stored as received.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        for (k, v) in self.fields.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value.into();
                return;
            }
        }
        self.fields.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set-of-pairs equality, ignoring order and name case. Used by the
    /// round-trip laws where field order is free.
    pub fn same_fields(&self, other: &Headers) -> bool {
        if self.fields.len() != other.fields.len() {
            return false;
        }
        self.iter().all(|(k, v)| {
            other
                .iter()
                .any(|(ok, ov)| ok.eq_ignore_ascii_case(k) && ov == v)
        })
    }
}

/// Protocol-specific attribute bag attached to a `MessageStart`. A closed sum
/// so filters can match exhaustively.
#[derive(Debug, Clone)]
pub enum MessageHead {
    Request(RequestHead),
    Response(ResponseHead),
    Mqtt(crate::codecs::mqtt::MqttHead),
    Thrift(crate::codecs::thrift::ThriftHead),
    Dubbo(crate::codecs::dubbo::DubboHead),
    Fcgi(crate::codecs::fcgi::FcgiRequestHead),
    Bgp(crate::codecs::bgp::BgpMessage),
}

impl MessageHead {
    pub fn as_request(&self) -> Option<&RequestHead> {
        match self {
            MessageHead::Request(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseHead> {
        match self {
            MessageHead::Response(h) => Some(h),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub protocol: String,
    pub method: String,
    pub path: String,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub headers: Headers,
}

impl Default for RequestHead {
    fn default() -> RequestHead {
        RequestHead {
            protocol: "HTTP/1.1".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            scheme: None,
            authority: None,
            headers: Headers::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub protocol: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
}

impl Default for ResponseHead {
    fn default() -> ResponseHead {
        ResponseHead {
            protocol: "HTTP/1.1".to_string(),
            status: 200,
            status_text: "OK".to_string(),
            headers: Headers::new(),
        }
    }
}

/// Trailers attached to a `MessageEnd`.
#[derive(Debug, Clone)]
pub enum MessageTail {
    Http(Headers),
    Fcgi(crate::codecs::fcgi::FcgiResponseTail),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive_get() {
        let mut h = Headers::new();
        h.push("Content-Length", "42");

        assert_eq!(h.get("content-length"), Some("42"));
        assert_eq!(h.get("CONTENT-LENGTH"), Some("42"));
        assert_eq!(h.get("content-type"), None);
    }

    #[test]
    fn test_headers_same_fields_ignores_order() {
        let mut a = Headers::new();
        a.push("Host", "h");
        a.push("Accept", "*/*");

        let mut b = Headers::new();
        b.push("accept", "*/*");
        b.push("host", "h");

        assert!(a.same_fields(&b));

        b.set("host", "other");
        assert!(!a.same_fields(&b));
    }

    #[test]
    fn test_event_is_end() {
        assert!(Event::message_end(None).is_end());
        assert!(Event::stream_end(None).is_end());
        assert!(!Event::message_start(None).is_end());
    }
}
