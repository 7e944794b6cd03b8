use std::rc::Rc;

use serde_derive::Deserialize;
use slog::Logger;

use sluice::codecs::http1;
use sluice::config::{DemuxOptions, SocketOptions};
use sluice::data::Data;
use sluice::demux::DemuxQueue;
use sluice::event::{Event, MessageHead, ResponseHead};
use sluice::net::worker::Worker;
use sluice::pipeline::{Filter, FilterCtx, PipelineLayout};

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default = "default_body")]
    body: String,
    #[serde(default)]
    socket: SocketOptions,
    #[serde(default)]
    demux: DemuxOptions,
    #[serde(default)]
    logging: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_body() -> String {
    "sluiced\n".to_string()
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen: default_listen(),
            body: default_body(),
            socket: SocketOptions::default(),
            demux: DemuxOptions::default(),
            logging: None,
        }
    }
}

/// Per-request handler: answers every request with a fixed body, echoing the
/// request path in a header.
struct Respond {
    body: String,
    path: String,
}

impl Filter for Respond {
    fn process(&mut self, _ctx: &mut FilterCtx, evt: Event, out: &mut dyn FnMut(Event)) {
        match evt {
            Event::MessageStart(start) => {
                if let Some(MessageHead::Request(h)) = &start.head {
                    self.path = h.path.clone();
                }
            }
            Event::MessageEnd(_) => {
                let mut head = ResponseHead::default();
                head.headers.push("content-type", "text/plain");
                head.headers.push("x-request-path", self.path.clone());
                out(Event::message_start(Some(MessageHead::Response(head))));
                out(Event::Data(Data::from_str(&self.body)));
                out(Event::message_end(None));
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.path.clear();
    }
}

fn service_layout(config: &Config) -> Rc<PipelineLayout> {
    let body = config.body.clone();
    let handler = PipelineLayout::new("respond")
        .append(move || Respond {
            body: body.clone(),
            path: String::new(),
        })
        .shared();
    let demux = config.demux.clone();
    PipelineLayout::new("http-service")
        .append(|| http1::Decoder::new(false))
        .append(move || DemuxQueue::new(demux.clone()))
        .append(|| http1::Encoder::new(true))
        .child(handler)
        .shared()
}

fn load_config(log: &Logger) -> Config {
    match std::env::args().nth(1) {
        Some(path) => match serdeconv::from_toml_file(&path) {
            Ok(config) => config,
            Err(err) => {
                slog::error!(log, "bad config file";
                             "context" => "load_config",
                             "path" => &path,
                             "error" => %err);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    }
}

fn main() {
    let boot_log = sluice::logging::init(None);
    let config = load_config(&boot_log);
    let log = match &config.logging {
        Some(toml) => sluice::logging::init(Some(toml)),
        None => boot_log,
    };

    slog::info!(log, "starting";
                "context" => "main",
                "listen" => &config.listen);

    let mut worker = Worker::new(&log).expect("reactor construction must succeed");
    let addr = config
        .listen
        .parse()
        .expect("listen address must be host:port");
    worker
        .listen(addr, service_layout(&config), config.socket.clone())
        .expect("listener must bind");

    if let Err(err) = worker.run() {
        slog::error!(log, "worker failed"; "context" => "main", "error" => %err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: Config = serdeconv::from_toml_str("").unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.demux.output_count, 1);
    }

    #[test]
    fn test_config_overrides() {
        let config: Config = serdeconv::from_toml_str(
            r#"
listen = "0.0.0.0:9000"
body = "hello"

[socket]
idle_timeout = 30.0

[demux]
wait_output = true
"#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.body, "hello");
        assert_eq!(config.socket.idle_timeout, 30.0);
        assert!(config.demux.wait_output);
    }

    #[test]
    fn test_service_layout_serves_request() {
        use sluice::pipeline::Pipeline;

        let config = Config::default();
        let mut p = Pipeline::new(service_layout(&config), None);
        let mut bytes = Vec::new();
        p.input(
            Event::Data(Data::from_slice(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")),
            &mut |e| {
                if let Event::Data(d) = e {
                    bytes.extend_from_slice(&d.to_vec());
                }
            },
        );
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("x-request-path: /x\r\n"));
        assert!(text.ends_with("sluiced\n"));
    }
}
