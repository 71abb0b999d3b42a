//! Metrics publishing: a flat key/value record per axis per publish tick,
//! emitted through a stateless sink.

use std::fmt::Write as _;
use std::net::UdpSocket;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Str(String),
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Float(v)
    }
}

impl From<i32> for Field {
    fn from(v: i32) -> Self {
        Field::Int(v as i64)
    }
}

impl From<u32> for Field {
    fn from(v: u32) -> Self {
        Field::UInt(v as u64)
    }
}

impl From<u64> for Field {
    fn from(v: u64) -> Self {
        Field::UInt(v)
    }
}

impl From<bool> for Field {
    fn from(v: bool) -> Self {
        Field::Bool(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::Str(v.to_string())
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Field::Str(v)
    }
}

pub trait MetricsSink: Send + Sync {
    fn publish(&self, measurement: &str, fields: &[(&'static str, Field)]);
}

/// Formats one record as an Influx line-protocol line with a nanosecond
/// timestamp. Booleans are rendered as 0/1 integers.
pub fn format_line(measurement: &str, fields: &[(&'static str, Field)]) -> String {
    let mut line = escape_key(measurement);
    for (i, (key, value)) in fields.iter().enumerate() {
        line.push(if i == 0 { ' ' } else { ',' });
        line.push_str(&escape_key(key));
        line.push('=');
        match value {
            Field::Float(v) => {
                let _ = write!(line, "{v}");
            }
            Field::Int(v) => {
                let _ = write!(line, "{v}i");
            }
            Field::UInt(v) => {
                let _ = write!(line, "{v}i");
            }
            Field::Bool(v) => {
                let _ = write!(line, "{}i", *v as u8);
            }
            Field::Str(v) => {
                let _ = write!(line, "\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""));
            }
        }
    }
    let now = chrono::Utc::now();
    let nanos = now.timestamp() * 1_000_000_000 + now.timestamp_subsec_nanos() as i64;
    let _ = write!(line, " {nanos}");
    line
}

fn escape_key(key: &str) -> String {
    key.replace(',', "\\,").replace(' ', "\\ ").replace('=', "\\=")
}

/// Sink that emits line-protocol records as debug log lines. Used when no
/// metrics endpoint is configured.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn publish(&self, measurement: &str, fields: &[(&'static str, Field)]) {
        debug!(target: "metrics", "{}", format_line(measurement, fields));
    }
}

/// Line-protocol emitter over UDP, e.g. toward a telegraf socket listener.
/// Send failures are logged and dropped; the sink is stateless.
pub struct UdpLineSink {
    socket: UdpSocket,
    address: String,
}

impl UdpLineSink {
    pub fn new(address: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            address: address.to_string(),
        })
    }
}

impl MetricsSink for UdpLineSink {
    fn publish(&self, measurement: &str, fields: &[(&'static str, Field)]) {
        let line = format_line(measurement, fields);
        if let Err(e) = self.socket.send_to(line.as_bytes(), &self.address) {
            warn!(address = %self.address, "metric publish failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_rendering() {
        let line = format_line(
            "azimuth",
            &[
                ("state", Field::Str("TRACK".to_string())),
                ("errors", Field::UInt(3)),
                ("pos", Field::Float(45.5)),
                ("out_of_limits", Field::Bool(false)),
                ("vel", Field::Int(-200)),
            ],
        );
        let payload = line.rsplit_once(' ').unwrap().0;
        assert_eq!(
            payload,
            "azimuth state=\"TRACK\",errors=3i,pos=45.5,out_of_limits=0i,vel=-200i"
        );
    }

    #[test]
    fn test_format_line_escaping() {
        let line = format_line("mount az", &[("last error", Field::Str("a \"b\"".into()))]);
        assert!(line.starts_with("mount\\ az last\\ error=\"a \\\"b\\\"\""));
    }

    #[test]
    fn test_format_line_timestamp_present() {
        let line = format_line("m", &[("x", Field::Int(1))]);
        let ts: i64 = line.rsplit_once(' ').unwrap().1.parse().unwrap();
        assert!(ts > 1_500_000_000_000_000_000);
    }
}
