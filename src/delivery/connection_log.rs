use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Transcript of a single delivery attempt against a recipient's MX,
/// flushed into `Recipient::last_error`/an `Event` once the attempt is
/// resolved.
#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ConnectionLog {
    lines: Vec<LogLine>,
}

#[derive(Debug, Deserialize, Serialize)]
struct LogLine {
    time: DateTime<Utc>,
    level: LogLevel,
    msg: String,
}

impl ConnectionLog {
    pub fn log(&mut self, level: LogLevel, msg: impl Display) {
        let line = LogLine {
            time: Utc::now(),
            level,
            msg: msg.to_string(),
        };
        self.lines.push(line);
    }

    pub fn summary(&self) -> String {
        self.lines
            .iter()
            .map(|l| format!("{:?} {}", l.level, l.msg))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
