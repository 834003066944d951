//! Subscriber installation and one-JSON-object-per-line output for results.

use serde::Serialize;
use std::io::Write;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub struct StructuredLogger;

impl StructuredLogger {
    /// Install the global subscriber on stderr. `RUST_LOG` overrides `default_level`.
    /// Calling it twice is harmless; the first subscriber stays.
    pub fn init(json: bool, default_level: &str) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let installed = if json {
            let fmt = tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NONE)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(fmt).try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
        };
        if installed.is_err() {
            tracing::debug!("subscriber already installed");
        }
    }

    /// Write `event` as a single JSON line. Serialization or write failures are dropped.
    pub fn emit_json(event: &impl Serialize, w: &mut impl Write) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(w, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Line<'a> {
        strategy: &'a str,
        cluster: usize,
    }

    #[test]
    fn emits_one_line_per_event() {
        let mut out = Vec::new();
        StructuredLogger::emit_json(&Line { strategy: "DBSCAN", cluster: 1 }, &mut out);
        StructuredLogger::emit_json(&Line { strategy: "Birch", cluster: 0 }, &mut out);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"strategy":"DBSCAN","cluster":1}"#);
    }

    #[test]
    fn init_twice_does_not_panic() {
        StructuredLogger::init(false, "warn");
        StructuredLogger::init(true, "debug");
    }
}
