use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::OutputConfig;
use crate::models::CoreEvent;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            "console" => OutputFormat::Console,
            other => {
                log::warn!("Unknown output format '{}', using jsonl", other);
                OutputFormat::Jsonl
            }
        }
    }
}

/// Writes core events to stdout or an append-only file
pub struct EventSink {
    format: OutputFormat,
    writer: Option<Box<dyn Write + Send>>,
}

impl EventSink {
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> Result<Self, OutputError> {
        let writer: Option<Box<dyn Write + Send>> = match file_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Box::new(BufWriter::new(file)))
            }
            None => None,
        };

        Ok(EventSink { format, writer })
    }

    pub fn from_config(config: &OutputConfig) -> Result<Self, OutputError> {
        Self::new(OutputFormat::parse(&config.format), config.file_path.clone())
    }

    pub fn write_event(&mut self, event: &CoreEvent) -> Result<(), OutputError> {
        let line = match self.format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(event)?),
            OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(event)?),
            OutputFormat::Console => format!("{}\n", console_line(event)),
        };
        self.write_output(&line)
    }

    fn write_output(&mut self, data: &str) -> Result<(), OutputError> {
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(data.as_bytes())?;
                writer.flush()?;
            }
            None => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(data.as_bytes())?;
                stdout.flush()?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }

    /// Drain the bus until every publisher is gone
    pub async fn run(mut self, mut rx: broadcast::Receiver<CoreEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.write_event(&event) {
                        log::error!("Failed to write {} event: {}", event.name(), e);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Event sink fell behind, {} events skipped", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
        if let Err(e) = self.flush() {
            log::error!("Failed to flush event output: {}", e);
        }
    }
}

fn console_line(event: &CoreEvent) -> String {
    match event {
        CoreEvent::SessionStarted(s) | CoreEvent::SessionUpdated(s) | CoreEvent::SessionStopped(s) => {
            format!(
                "[{}] {} - {} on {} ({}) from {} [{}]",
                event.name(),
                s.username.as_deref().unwrap_or(&s.server_user_id),
                s.media.title,
                s.server_id,
                s.state,
                s.ip_address,
                s.geo.display_location()
            )
        }
        CoreEvent::ViolationCreated(v) => format!(
            "[{}] {} - User: {}, Session: {}, Severity: {}",
            event.name(),
            v.rule_type,
            v.server_user_id,
            v.session_id,
            v.severity
        ),
        CoreEvent::ServerStatusChanged { server_id, status } => {
            format!("[{}] {} is {:?}", event.name(), server_id, status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::session::fixtures::{session, t0};
    use crate::models::ServerStatus;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");

        let mut sink = EventSink::new(OutputFormat::Jsonl, Some(path.clone())).unwrap();
        sink.write_event(&CoreEvent::SessionStarted(session("alice", "k1", "1.1.1.1", t0())))
            .unwrap();
        sink.write_event(&CoreEvent::ServerStatusChanged {
            server_id: "plex-main".to_string(),
            status: ServerStatus::Down,
        })
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "session_started");
        assert_eq!(first["payload"]["serverUserId"], "alice");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["payload"]["status"], "down");
    }

    #[test]
    fn test_console_line() {
        let line = console_line(&CoreEvent::SessionStopped(session("alice", "k1", "1.1.1.1", t0())));
        assert!(line.starts_with("[session_stopped] alice - Movie 100 on srv1"));
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(OutputFormat::parse("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("console"), OutputFormat::Console);
        assert_eq!(OutputFormat::parse("xml"), OutputFormat::Jsonl);
    }

    #[test]
    fn test_run_drains_bus() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = EventSink::new(OutputFormat::Jsonl, Some(path.clone())).unwrap();

        let bus = EventBus::new(8);
        let rx = bus.subscribe();
        bus.publish(CoreEvent::ServerStatusChanged {
            server_id: "jf".to_string(),
            status: ServerStatus::Up,
        });
        drop(bus);

        tokio_test::block_on(sink.run(rx));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
