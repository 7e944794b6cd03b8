use slog::{o, Discard, Logger};
use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the root logger from a sloggers TOML snippet, falling back to the
/// default terminal logger when `toml` is `None`.
pub fn init(toml: Option<&str>) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml.unwrap_or(DEFAULT_CONFIG))
        .expect("logger config must be valid TOML");
    config
        .build_logger()
        .expect("logger construction must succeed")
}

/// A logger that drops everything. Components take `Into<Option<&Logger>>`
/// and call this when handed `None`.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logger_builds() {
        let log = init(None);
        slog::info!(log, "logger ready"; "context" => "test");
    }

    #[test]
    fn test_discard_logger() {
        let log = discard();
        slog::debug!(log, "dropped");
    }
}
