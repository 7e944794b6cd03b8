//! Protocol codecs. Each pairs a decoder (bytes in, events out) with an
//! encoder (events in, bytes out), built on the deframer's framing
//! discipline. Decoders surface malformed input as
//! `StreamEnd(ProtocolError)`; no partial message is ever delivered.

pub mod bgp;
pub mod dubbo;
pub mod fcgi;
pub mod hessian;
pub mod http1;
pub mod http2;
pub mod mqtt;
pub mod protobuf;
pub mod thrift;
