use serde_derive::Deserialize;

fn default_congestion_limit() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

/// Socket tuning knobs. Timeouts of zero are disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketOptions {
    #[serde(default = "default_congestion_limit")]
    pub congestion_limit: usize,
    #[serde(default)]
    pub buffer_limit: usize,
    #[serde(default)]
    pub read_timeout: f64,
    #[serde(default)]
    pub write_timeout: f64,
    #[serde(default)]
    pub idle_timeout: f64,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_true")]
    pub no_delay: bool,
}

impl Default for SocketOptions {
    fn default() -> SocketOptions {
        SocketOptions {
            congestion_limit: default_congestion_limit(),
            buffer_limit: 0,
            read_timeout: 0.0,
            write_timeout: 0.0,
            idle_timeout: 0.0,
            keep_alive: true,
            no_delay: true,
        }
    }
}

fn default_output_count() -> usize {
    1
}

/// Demux queue knobs. `output_count` is the number of complete response
/// messages each request is expected to produce; `wait_output` defers the
/// next inbound message until the current one has finished responding.
#[derive(Debug, Clone, Deserialize)]
pub struct DemuxOptions {
    #[serde(default = "default_output_count")]
    pub output_count: usize,
    #[serde(default)]
    pub wait_output: bool,
    #[serde(default)]
    pub max_messages: usize,
    #[serde(default)]
    pub max_header_size: usize,
}

impl Default for DemuxOptions {
    fn default() -> DemuxOptions {
        DemuxOptions {
            output_count: 1,
            wait_output: false,
            max_messages: 0,
            max_header_size: 0,
        }
    }
}

/// Protocol selection for an HTTP mux session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpVersion {
    Http1,
    Http2,
}

impl Default for HttpVersion {
    fn default() -> HttpVersion {
        HttpVersion::Http1
    }
}

fn default_max_idle() -> f64 {
    10.0
}

/// Mux session-pool knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct MuxOptions {
    #[serde(default)]
    pub max_queue: usize,
    #[serde(default)]
    pub max_messages_per_session: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: f64,
    #[serde(default)]
    pub version: HttpVersion,
}

impl Default for MuxOptions {
    fn default() -> MuxOptions {
        MuxOptions {
            max_queue: 0,
            max_messages_per_session: 0,
            max_idle: default_max_idle(),
            version: HttpVersion::Http1,
        }
    }
}

fn default_connection_window() -> usize {
    0xf_ffff
}

fn default_stream_window() -> usize {
    0xffff
}

fn default_max_frame_size() -> usize {
    0x4000
}

/// HTTP/2 endpoint knobs, advertised to the peer via SETTINGS.
#[derive(Debug, Clone, Deserialize)]
pub struct Http2Options {
    #[serde(default = "default_connection_window")]
    pub connection_window_size: usize,
    #[serde(default = "default_stream_window")]
    pub stream_window_size: usize,
    #[serde(default)]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default)]
    pub max_header_list_size: usize,
}

impl Default for Http2Options {
    fn default() -> Http2Options {
        Http2Options {
            connection_window_size: default_connection_window(),
            stream_window_size: default_stream_window(),
            max_concurrent_streams: 0,
            max_frame_size: default_max_frame_size(),
            max_header_list_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_options_from_toml() {
        let opts: SocketOptions = serdeconv::from_toml_str(
            r#"
congestion_limit = 65536
read_timeout = 5.0
keep_alive = false
"#,
        )
        .unwrap();

        assert_eq!(opts.congestion_limit, 65536);
        assert_eq!(opts.read_timeout, 5.0);
        assert!(!opts.keep_alive);
        assert!(opts.no_delay);
        assert_eq!(opts.idle_timeout, 0.0);
    }

    #[test]
    fn test_demux_options_defaults() {
        let opts: DemuxOptions = serdeconv::from_toml_str("").unwrap();
        assert_eq!(opts.output_count, 1);
        assert!(!opts.wait_output);
    }

    #[test]
    fn test_http2_options_defaults() {
        let opts = Http2Options::default();
        assert_eq!(opts.max_frame_size, 0x4000);
        assert_eq!(opts.stream_window_size, 0xffff);
    }
}
