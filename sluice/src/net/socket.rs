use std::io::{Read, Write};
use std::net::Shutdown;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::{TcpStream, UdpSocket};
use slog::{o, Logger};

use crate::config::SocketOptions;
use crate::data::{Data, CHUNK_SIZE};
use crate::event::{ErrorKind, Event};
use crate::net::{NetError, NetResult};
use crate::pipeline::Tap;

const READ_CHUNK: usize = CHUNK_SIZE * 4;

/// Send-queue watermark tracking. Above the limit the producing tap closes;
/// below half the limit it opens again.
pub struct Congestion {
    limit: usize,
    tap: Rc<Tap>,
}

impl Congestion {
    pub fn new(limit: usize, tap: Rc<Tap>) -> Congestion {
        Congestion { limit, tap }
    }

    pub fn update(&self, queued: usize) {
        if self.limit == 0 {
            return;
        }
        if queued > self.limit {
            self.tap.close();
        } else if queued < self.limit / 2 {
            self.tap.open();
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    Idle,
    Open,
    HalfClosedRemote,
    HalfClosedLocal,
    Closed,
}

/// A TCP endpoint with independent read and write pumps.
///
/// Writes are never issued concurrently: one `send` call drains the queue
/// end-to-end until `WouldBlock`. Receiving a `StreamEnd` from upstream is a
/// write-side shutdown once the queue empties; peer EOF is a read-side
/// shutdown. Full close happens when both sides are done and nothing is
/// queued.
pub struct SocketTcp {
    stream: TcpStream,
    state: SocketState,
    options: SocketOptions,
    send_buffer: Data,
    eos: Option<Event>,
    congestion: Congestion,
    last_read: Instant,
    last_write: Instant,
    write_progress: Instant,
    log: Logger,
}

impl SocketTcp {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        stream: TcpStream,
        options: SocketOptions,
        tap: Rc<Tap>,
        log: L,
    ) -> SocketTcp {
        let log = match log.into() {
            Some(log) => log.new(o!()),
            None => crate::logging::discard(),
        };
        let now = Instant::now();
        if options.no_delay {
            let _ = stream.set_nodelay(true);
        }
        let congestion = Congestion::new(options.congestion_limit, tap);
        SocketTcp {
            stream,
            state: SocketState::Open,
            options,
            send_buffer: Data::new(),
            eos: None,
            congestion,
            last_read: now,
            last_write: now,
            write_progress: now,
            log,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SocketState::Closed
    }

    pub fn buffered(&self) -> usize {
        self.send_buffer.len()
    }

    pub fn has_egress(&self) -> bool {
        !self.send_buffer.is_empty() || self.eos.is_some()
    }

    /// Accepts one event from the pipeline side. Only `Data` and `StreamEnd`
    /// have meaning at the byte edge; anything else indicates a missing
    /// encoder upstream and is dropped with a log line.
    pub fn output(&mut self, evt: Event) {
        match evt {
            Event::Data(data) => {
                if self.state == SocketState::Closed || self.eos.is_some() {
                    return;
                }
                if self.options.buffer_limit > 0
                    && self.send_buffer.len() + data.len() > self.options.buffer_limit
                {
                    slog::warn!(self.log, "send buffer overflow";
                                "context" => "output",
                                "buffered" => self.send_buffer.len(),
                                "limit" => self.options.buffer_limit);
                    self.eos = Some(Event::stream_end(Some(ErrorKind::BufferOverflow)));
                    return;
                }
                self.send_buffer.push(data);
                self.congestion.update(self.send_buffer.len());
            }
            Event::StreamEnd(e) => {
                if self.eos.is_none() {
                    self.eos = Some(Event::StreamEnd(e));
                }
            }
            _ => {
                slog::debug!(self.log, "non-byte event reached socket"; "context" => "output");
            }
        }
    }

    /// Read pump: pulls everything available off the wire into `Data`
    /// events. Returns the events plus whether the peer closed its side.
    pub fn receive(&mut self, now: Instant) -> NetResult<(Vec<Event>, bool)> {
        let mut events = Vec::new();
        let mut peer_closed = false;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.last_read = now;
                    events.push(Event::Data(Data::from_slice(&buf[..n])));
                }
                Err(err) => match NetError::from(err) {
                    NetError::Wait => break,
                    NetError::Fatal(kind) => return Err(NetError::Fatal(kind)),
                },
            }
        }
        if peer_closed {
            self.on_read_closed();
        }
        Ok((events, peer_closed))
    }

    fn on_read_closed(&mut self) {
        self.state = match self.state {
            SocketState::Open => SocketState::HalfClosedRemote,
            SocketState::HalfClosedLocal => SocketState::Closed,
            s => s,
        };
    }

    /// Write pump: a single in-flight write drains the send buffer
    /// end-to-end before the next one starts. End-of-stream triggers a
    /// write-side shutdown once the buffer empties.
    pub fn send(&mut self, now: Instant) -> NetResult<usize> {
        let mut sent = 0;
        while !self.send_buffer.is_empty() {
            let mut chunk = [0u8; READ_CHUNK];
            let len = self.send_buffer.len().min(READ_CHUNK);
            let mut piece = Data::new();
            self.send_buffer.shift_to(len, &mut piece);
            piece.to_bytes(&mut chunk[..len]);
            match self.stream.write(&chunk[..len]) {
                Ok(n) => {
                    sent += n;
                    self.last_write = now;
                    self.write_progress = now;
                    if n < len {
                        // Unwritten remainder goes back to the queue front.
                        let mut rest = Data::new();
                        piece.shift(n);
                        rest.push(piece);
                        rest.push(std::mem::replace(&mut self.send_buffer, Data::new()));
                        self.send_buffer = rest;
                        break;
                    }
                }
                Err(err) => {
                    // Not transmitted; restore before deciding.
                    let mut rest = Data::new();
                    rest.push(piece);
                    rest.push(std::mem::replace(&mut self.send_buffer, Data::new()));
                    self.send_buffer = rest;
                    match NetError::from(err) {
                        NetError::Wait => break,
                        NetError::Fatal(_) => {
                            return Err(NetError::Fatal(ErrorKind::WriteError));
                        }
                    }
                }
            }
        }
        self.congestion.update(self.send_buffer.len());
        if self.send_buffer.is_empty() && self.eos.is_some() {
            self.shutdown_write();
        }
        Ok(sent)
    }

    fn shutdown_write(&mut self) {
        match self.state {
            SocketState::Open => {
                let _ = self.stream.shutdown(Shutdown::Write);
                self.state = SocketState::HalfClosedLocal;
            }
            SocketState::HalfClosedRemote => {
                let _ = self.stream.shutdown(Shutdown::Both);
                self.state = SocketState::Closed;
            }
            _ => {}
        }
        slog::debug!(self.log, "write side shut down";
                     "context" => "shutdown_write",
                     "state" => ?self.state);
    }

    pub fn close(&mut self) {
        if self.state != SocketState::Closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.state = SocketState::Closed;
        }
    }

    /// Timeout scan from the shared ticker. Returns the error to emit
    /// downstream when a deadline lapsed.
    pub fn on_tick(&mut self, now: Instant) -> Option<ErrorKind> {
        let check = |timeout: f64, since: Instant| {
            timeout > 0.0 && now.duration_since(since) >= Duration::from_secs_f64(timeout)
        };
        if check(self.options.read_timeout, self.last_read) {
            return Some(ErrorKind::ReadTimeout);
        }
        if self.has_egress() && check(self.options.write_timeout, self.write_progress) {
            return Some(ErrorKind::WriteTimeout);
        }
        if check(self.options.idle_timeout, self.last_read.max(self.last_write)) {
            return Some(ErrorKind::IdleTimeout);
        }
        None
    }
}

/// A UDP endpoint. Each datagram maps to one `Data` event; there is no
/// ordering or session state at this layer.
pub struct SocketUdp {
    socket: UdpSocket,
    log: Logger,
}

impl SocketUdp {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(socket: UdpSocket, log: L) -> SocketUdp {
        let log = match log.into() {
            Some(log) => log.new(o!()),
            None => crate::logging::discard(),
        };
        SocketUdp { socket, log }
    }

    pub fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    pub fn receive(&mut self) -> NetResult<Vec<(std::net::SocketAddr, Data)>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => out.push((from, Data::from_slice(&buf[..n]))),
                Err(err) => match NetError::from(err) {
                    NetError::Wait => break,
                    NetError::Fatal(kind) => return Err(NetError::Fatal(kind)),
                },
            }
        }
        Ok(out)
    }

    pub fn send(&mut self, to: std::net::SocketAddr, data: &Data) -> NetResult<()> {
        let bytes = data.to_vec();
        match self.socket.send_to(&bytes, to) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(_) => {
                slog::warn!(self.log, "short datagram send"; "context" => "send");
                Ok(())
            }
            Err(err) => Err(NetError::from(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_congestion_watermarks() {
        let tap = Tap::new();
        let congestion = Congestion::new(100, tap.clone());

        congestion.update(50);
        assert!(tap.is_open());

        congestion.update(150);
        assert!(!tap.is_open());

        // Still above the low-water mark: stays closed.
        congestion.update(80);
        assert!(!tap.is_open());

        congestion.update(40);
        assert!(tap.is_open());
    }

    #[test]
    fn test_congestion_disabled() {
        let tap = Tap::new();
        let congestion = Congestion::new(0, tap.clone());
        congestion.update(usize::MAX);
        assert!(tap.is_open());
    }
}
