//! Body compression filters over `flate2`. Each message body is treated as
//! one compression stream: started at `MessageStart`, finished at
//! `MessageEnd`.

use std::io::Write;

use flate2::write::{DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder};
use flate2::Compression;

use crate::data::Data;
use crate::event::{ErrorKind, Event};
use crate::pipeline::{Filter, FilterCtx};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Method {
    Gzip,
    Deflate,
}

enum Coder {
    GzipIn(GzDecoder<Vec<u8>>),
    DeflateIn(DeflateDecoder<Vec<u8>>),
    GzipOut(GzEncoder<Vec<u8>>),
    DeflateOut(DeflateEncoder<Vec<u8>>),
}

impl Coder {
    fn inflater(method: Method) -> Coder {
        match method {
            Method::Gzip => Coder::GzipIn(GzDecoder::new(Vec::new())),
            Method::Deflate => Coder::DeflateIn(DeflateDecoder::new(Vec::new())),
        }
    }

    fn deflater(method: Method) -> Coder {
        match method {
            Method::Gzip => Coder::GzipOut(GzEncoder::new(Vec::new(), Compression::default())),
            Method::Deflate => {
                Coder::DeflateOut(DeflateEncoder::new(Vec::new(), Compression::default()))
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Coder::GzipIn(c) => c.write_all(bytes),
            Coder::DeflateIn(c) => c.write_all(bytes),
            Coder::GzipOut(c) => c.write_all(bytes),
            Coder::DeflateOut(c) => c.write_all(bytes),
        }
    }

    /// Drains bytes produced so far without ending the stream.
    fn take(&mut self) -> Vec<u8> {
        let buf = match self {
            Coder::GzipIn(c) => c.get_mut(),
            Coder::DeflateIn(c) => c.get_mut(),
            Coder::GzipOut(c) => c.get_mut(),
            Coder::DeflateOut(c) => c.get_mut(),
        };
        std::mem::take(buf)
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Coder::GzipIn(c) => c.finish(),
            Coder::DeflateIn(c) => c.finish(),
            Coder::GzipOut(c) => c.finish(),
            Coder::DeflateOut(c) => c.finish(),
        }
    }
}

/// Inflates message bodies.
pub struct Decompress {
    method: Method,
    coder: Option<Coder>,
}

impl Decompress {
    pub fn new(method: Method) -> Decompress {
        Decompress {
            method,
            coder: None,
        }
    }
}

/// Deflates message bodies.
pub struct Compress {
    method: Method,
    coder: Option<Coder>,
}

impl Compress {
    pub fn new(method: Method) -> Compress {
        Compress {
            method,
            coder: None,
        }
    }
}

fn run_body(
    coder: &mut Option<Coder>,
    make: impl FnOnce() -> Coder,
    evt: Event,
    out: &mut dyn FnMut(Event),
) {
    match evt {
        Event::MessageStart(start) => {
            *coder = Some(make());
            out(Event::MessageStart(start));
        }
        Event::Data(data) => match coder.as_mut() {
            Some(c) => {
                let mut failed = false;
                data.for_each_chunk(|s| {
                    if c.write(s).is_err() {
                        failed = true;
                    }
                });
                if failed {
                    *coder = None;
                    out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                    return;
                }
                let produced = c.take();
                if !produced.is_empty() {
                    out(Event::Data(Data::from_slice(&produced)));
                }
            }
            None => out(Event::Data(data)),
        },
        Event::MessageEnd(end) => {
            if let Some(c) = coder.take() {
                match c.finish() {
                    Ok(produced) => {
                        if !produced.is_empty() {
                            out(Event::Data(Data::from_slice(&produced)));
                        }
                    }
                    Err(_) => {
                        out(Event::stream_end(Some(ErrorKind::ProtocolError)));
                        return;
                    }
                }
            }
            out(Event::MessageEnd(end));
        }
        Event::StreamEnd(eos) => {
            *coder = None;
            out(Event::StreamEnd(eos));
        }
    }
}

impl Filter for Decompress {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        let method = self.method;
        run_body(&mut self.coder, || Coder::inflater(method), evt, out);
    }

    fn reset(&mut self) {
        self.coder = None;
    }
}

impl Filter for Compress {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        let method = self.method;
        run_body(&mut self.coder, || Coder::deflater(method), evt, out);
    }

    fn reset(&mut self) {
        self.coder = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, PipelineLayout};

    fn round_trip(method: Method, body: &[u8]) -> Vec<u8> {
        let layout = PipelineLayout::new("zip-unzip")
            .append(move || Compress::new(method))
            .append(move || Decompress::new(method))
            .shared();
        let mut p = Pipeline::new(layout, None);

        let mut got = Vec::new();
        for evt in vec![
            Event::message_start(None),
            Event::Data(Data::from_slice(body)),
            Event::message_end(None),
        ] {
            p.input(evt, &mut |e| {
                if let Event::Data(d) = e {
                    got.extend_from_slice(&d.to_vec());
                }
            });
        }
        got
    }

    #[test]
    fn test_gzip_round_trip() {
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(round_trip(Method::Gzip, &body), body);
    }

    #[test]
    fn test_deflate_round_trip() {
        let body = b"the quick brown fox jumps over the lazy dog".repeat(50);
        assert_eq!(round_trip(Method::Deflate, &body), body);
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(round_trip(Method::Gzip, b""), b"");
    }

    #[test]
    fn test_compress_shrinks_repetitive_body() {
        let body = vec![b'a'; 100_000];
        let layout = PipelineLayout::new("zip")
            .append(|| Compress::new(Method::Gzip))
            .shared();
        let mut p = Pipeline::new(layout, None);
        let mut compressed = 0;
        for evt in vec![
            Event::message_start(None),
            Event::Data(Data::from_slice(&body)),
            Event::message_end(None),
        ] {
            p.input(evt, &mut |e| {
                if let Event::Data(d) = e {
                    compressed += d.len();
                }
            });
        }
        assert!(compressed < body.len() / 10);
    }

    #[test]
    fn test_garbage_inflate_is_protocol_error() {
        let layout = PipelineLayout::new("unzip")
            .append(|| Decompress::new(Method::Gzip))
            .shared();
        let mut p = Pipeline::new(layout, None);
        let mut saw_error = false;
        for evt in vec![
            Event::message_start(None),
            Event::Data(Data::from_slice(&[0xde, 0xad, 0xbe, 0xef])),
            Event::message_end(None),
        ] {
            p.input(evt, &mut |e| {
                if let Event::StreamEnd(se) = e {
                    saw_error = se.error == Some(ErrorKind::ProtocolError);
                }
            });
        }
        assert!(saw_error);
    }
}
