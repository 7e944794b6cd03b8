use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slog::{o, Logger};

use crate::config::SocketOptions;
use crate::event::Event;
use crate::net::socket::SocketTcp;
use crate::net::NetError;
use crate::pipeline::{Pipeline, PipelineLayout};
use crate::timer::{Ticker, Timers};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

struct Listener {
    listener: TcpListener,
    layout: Rc<PipelineLayout>,
    options: SocketOptions,
}

struct Connection {
    socket: SocketTcp,
    pipeline: Pipeline,
}

/// Single-threaded cooperative worker. Owns the I/O reactor, every pipeline
/// running on it, the timer queue and the ticker. All callbacks run on the
/// worker that initiated them; filters run to completion within one event
/// delivery.
pub struct Worker {
    poll: Poll,
    events: Events,
    listeners: HashMap<Token, Listener>,
    connections: HashMap<Token, Connection>,
    live: IndexSet<Token>,
    pub timers: Timers,
    ticker: Ticker,
    next_token: usize,
    log: Logger,
}

impl Worker {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> io::Result<Worker> {
        let log = match log.into() {
            Some(log) => log.new(o!()),
            None => crate::logging::discard(),
        };
        Ok(Worker {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            listeners: HashMap::new(),
            connections: HashMap::new(),
            live: IndexSet::new(),
            timers: Timers::new(),
            ticker: Ticker::new(TICK_INTERVAL),
            next_token: 0,
            log,
        })
    }

    fn token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Binds a listener; each accepted connection gets a fresh pipeline
    /// instantiated from `layout`, its input fed from the socket and its
    /// output flushed back to the same socket.
    pub fn listen(
        &mut self,
        addr: SocketAddr,
        layout: Rc<PipelineLayout>,
        options: SocketOptions,
    ) -> io::Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr)?;
        let bound = listener.local_addr()?;
        let token = self.token();
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        slog::info!(self.log, "listening"; "context" => "listen", "addr" => %bound);
        self.listeners.insert(
            token,
            Listener {
                listener,
                layout,
                options,
            },
        );
        Ok(bound)
    }

    /// One reactor turn: poll readiness, accept, pump reads and writes, run
    /// due timers and the ticker.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let poll_timeout = match (timeout, self.timers.next_deadline()) {
            (Some(t), Some(d)) => Some(t.min(d.saturating_duration_since(Instant::now()))),
            (Some(t), None) => Some(t),
            (None, Some(d)) => Some(d.saturating_duration_since(Instant::now())),
            (None, None) => Some(TICK_INTERVAL),
        };
        match self.poll.poll(&mut self.events, poll_timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
        let now = Instant::now();

        let mut ready = Vec::new();
        for event in self.events.iter() {
            ready.push((
                event.token(),
                event.is_readable(),
                event.is_writable(),
            ));
        }

        for (token, readable, writable) in ready {
            if self.listeners.contains_key(&token) {
                self.accept(token)?;
            } else if self.connections.contains_key(&token) {
                self.pump(token, readable, writable, now);
            }
        }

        // Taps reopened since the last turn resume their read side.
        let tokens: Vec<Token> = self.live.iter().copied().collect();
        for token in tokens {
            if let Some(conn) = self.connections.get_mut(&token) {
                if conn.pipeline.tap().take_dirty() && conn.pipeline.tap().is_open() {
                    self.pump(token, true, true, now);
                }
            }
        }

        self.timers.poll(now);
        if self.ticker.due(now) {
            self.tick(now);
        }
        self.reap();
        Ok(())
    }

    /// Runs the reactor until no listeners or connections remain.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.listeners.is_empty() || !self.connections.is_empty() {
            self.run_once(None)?;
        }
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn accept(&mut self, token: Token) -> io::Result<()> {
        loop {
            let (stream, peer, layout, options) = {
                let l = self
                    .listeners
                    .get_mut(&token)
                    .expect("accept on a registered listener");
                match l.listener.accept() {
                    Ok((stream, peer)) => (stream, peer, l.layout.clone(), l.options.clone()),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                }
            };
            let conn_token = self.token();
            let pipeline = Pipeline::new(layout, &self.log);
            let mut socket = SocketTcp::new(stream, options, pipeline.tap(), &self.log);
            self.poll.registry().register(
                socket.stream_mut(),
                conn_token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
            slog::debug!(self.log, "connection accepted";
                         "context" => "accept",
                         "peer" => %peer);
            self.connections.insert(conn_token, Connection { socket, pipeline });
            self.live.insert(conn_token);
        }
    }

    fn pump(&mut self, token: Token, readable: bool, writable: bool, now: Instant) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };

        if readable && conn.pipeline.tap().is_open() {
            match conn.socket.receive(now) {
                Ok((events, peer_closed)) => {
                    for evt in events {
                        Self::deliver(conn, evt);
                    }
                    if peer_closed {
                        Self::deliver(conn, Event::stream_end(None));
                    }
                }
                Err(NetError::Fatal(kind)) => {
                    Self::deliver(conn, Event::stream_end(Some(kind)));
                    conn.socket.close();
                }
                Err(NetError::Wait) => {}
            }
        }

        if writable || conn.socket.has_egress() {
            if let Err(NetError::Fatal(kind)) = conn.socket.send(now) {
                Self::deliver(conn, Event::stream_end(Some(kind)));
                conn.socket.close();
            }
        }
    }

    fn deliver(conn: &mut Connection, evt: Event) {
        let socket = &mut conn.socket;
        conn.pipeline.input(evt, &mut |e| socket.output(e));
    }

    fn tick(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (token, conn) in self.connections.iter_mut() {
            if let Some(kind) = conn.socket.on_tick(now) {
                expired.push((*token, kind));
            }
        }
        for (token, kind) in expired {
            if let Some(conn) = self.connections.get_mut(&token) {
                slog::debug!(self.log, "socket timeout";
                             "context" => "tick",
                             "kind" => ?kind);
                Self::deliver(conn, Event::stream_end(Some(kind)));
                conn.socket.output(Event::stream_end(Some(kind)));
                let _ = conn.socket.send(now);
                conn.socket.close();
            }
        }
    }

    fn reap(&mut self) {
        let dead: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.socket.is_closed() && !c.socket.has_egress())
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(conn.socket.stream_mut());
            }
            self.live.shift_remove(&token);
            slog::debug!(self.log, "connection reaped"; "context" => "reap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::pipeline::{Filter, FilterCtx};
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    /// Byte-level echo.
    struct EchoBytes;

    impl Filter for EchoBytes {
        fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
            out(evt);
        }
    }

    #[test]
    fn test_tcp_echo_end_to_end() {
        let layout = PipelineLayout::new("echo").append(|| EchoBytes).shared();
        let mut worker = Worker::new(None).unwrap();
        let addr = worker
            .listen(
                "127.0.0.1:0".parse().unwrap(),
                layout,
                SocketOptions::default(),
            )
            .unwrap();

        let handle = std::thread::spawn(move || {
            let mut client = StdTcpStream::connect(addr).unwrap();
            client.write_all(b"ping").unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            buf
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !handle.is_finished() {
            worker.run_once(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(&handle.join().unwrap(), b"ping");
    }

    #[test]
    fn test_connection_reaped_after_close() {
        let layout = PipelineLayout::new("echo").append(|| EchoBytes).shared();
        let mut worker = Worker::new(None).unwrap();
        let addr = worker
            .listen(
                "127.0.0.1:0".parse().unwrap(),
                layout,
                SocketOptions::default(),
            )
            .unwrap();

        let client = StdTcpStream::connect(addr).unwrap();
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            worker.run_once(Some(Duration::from_millis(10))).unwrap();
            if worker.connection_count() == 0 {
                break;
            }
        }
        assert_eq!(worker.connection_count(), 0);
    }

    #[test]
    fn test_data_round_trip_through_socket_buffers() {
        // The send path re-chunks the rope; bytes must come out identical.
        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let layout = PipelineLayout::new("echo").append(|| EchoBytes).shared();
        let mut worker = Worker::new(None).unwrap();
        let addr = worker
            .listen(
                "127.0.0.1:0".parse().unwrap(),
                layout,
                SocketOptions::default(),
            )
            .unwrap();

        let expect = payload.clone();
        let handle = std::thread::spawn(move || {
            let mut client = StdTcpStream::connect(addr).unwrap();
            client.write_all(&expect).unwrap();
            client.shutdown(std::net::Shutdown::Write).unwrap();
            let mut got = Vec::new();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let _ = client.read_to_end(&mut got);
            got
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !handle.is_finished() {
            worker.run_once(Some(Duration::from_millis(5))).unwrap();
        }
        assert_eq!(handle.join().unwrap(), payload);
    }

    #[test]
    fn test_data_chunking() {
        let data = Data::from_slice(&[7u8; 10]);
        assert_eq!(data.len(), 10);
    }
}
