//! `Sluice` is a programmable network-traffic processor. Bytes enter through
//! listeners, are shaped by composable filter chains into messages, routed and
//! transformed, then re-serialized to outbound connections.
//!
//! The crate is structured leaves-first: the event model and the byte rope are
//! the currency every other module trades in, the deframer turns bytes into
//! protocol fields, pipelines chain filters, and the mux/demux machinery maps
//! many logical streams onto one transport.

pub mod buffer;
pub mod codecs;
pub mod compress;
pub mod config;
pub mod data;
pub mod deframer;
pub mod demux;
pub mod event;
pub mod logging;
pub mod mux;
pub mod net;
pub mod pipeline;
pub mod scarce;
pub mod timer;
