use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;

use serde::Serialize;

use crate::error::ProbeError;
use crate::utils::clock::{RoundTrip, Timestamp};

/// how measurement records are rendered
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum Format {
    #[default]
    Human,
    Tsv,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Human => write!(f, "human"),
            Format::Tsv => write!(f, "tsv"),
            Format::Json => write!(f, "json"),
        }
    }
}

/// one line of measurement output
pub trait Record {
    /// column names, written once before the first TSV record
    fn tsv_header(&self) -> &'static str;
    fn to_human(&self) -> String;
    fn to_tsv(&self) -> String;
    fn to_json(&self) -> serde_json::Value;
}

/// an echoed datagram arriving back at the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EchoRecord {
    pub arrival: Timestamp,
    pub sequence: u32,
    pub size: usize,
    pub rtt: RoundTrip,
}
impl Record for EchoRecord {
    fn tsv_header(&self) -> &'static str {
        "arrival\tsequence\tsize\trtt"
    }

    fn to_human(&self) -> String {
        format!(
            "{}  sequence {:>8}  {:>5} bytes  rtt {:.3} ms",
            self.arrival.format_local(),
            self.sequence,
            self.size,
            self.rtt.as_millis_f64()
        )
    }

    fn to_tsv(&self) -> String {
        format!("{}\t{}\t{}\t{}", self.arrival, self.sequence, self.size, self.rtt)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "echo",
            "arrival": self.arrival,
            "sequence": self.sequence,
            "size": self.size,
            "rtt_ns": i64::try_from(self.rtt.as_nanos()).unwrap_or(i64::MAX),
        })
    }
}

/// a datagram arriving at the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArrivalRecord {
    /// when the kernel queued the datagram, if it reported that
    pub kernel_time: Option<Timestamp>,
    /// when the receive loop picked it up
    pub user_time: Timestamp,
    pub source: SocketAddr,
    pub sequence: u32,
    pub size: usize,
    pub echoed: bool,
}
impl Record for ArrivalRecord {
    fn tsv_header(&self) -> &'static str {
        "kernel_time\tuser_time\tsource\tsequence\tsize\techoed"
    }

    fn to_human(&self) -> String {
        let kernel_time = match self.kernel_time {
            Some(time) => time.format_local(),
            None => "-".to_string(),
        };
        format!(
            "{}  {}  from {}  sequence {:>8}  {:>5} bytes{}",
            kernel_time,
            self.user_time.format_local(),
            self.source,
            self.sequence,
            self.size,
            if self.echoed { "  echoed" } else { "" }
        )
    }

    fn to_tsv(&self) -> String {
        let kernel_time = match self.kernel_time {
            Some(time) => time.to_string(),
            None => "-".to_string(),
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            kernel_time,
            self.user_time,
            self.source,
            self.sequence,
            self.size,
            u8::from(self.echoed)
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "arrival",
            "kernel_time": self.kernel_time,
            "user_time": self.user_time,
            "source": self.source.to_string(),
            "sequence": self.sequence,
            "size": self.size,
            "echoed": self.echoed,
        })
    }
}

/// where measurement records go: standard output or a file
pub struct OutputSink {
    writer: Box<dyn Write + Send>,
    format: Format,
    destination: String,
    header_written: bool,
    failures: u64,
}
impl OutputSink {
    pub fn open(path: Option<&Path>, format: Format) -> Result<OutputSink, ProbeError> {
        match path {
            Some(path) => {
                let file = File::create(path)
                    .map_err(|e| ProbeError::OutputSink(format!("{}: {}", path.display(), e)))?;
                log::debug!("writing {} records to {}", format, path.display());
                Ok(OutputSink::new(Box::new(BufWriter::new(file)), format, path.display().to_string()))
            },
            None => Ok(OutputSink::new(Box::new(io::stdout()), format, "stdout".to_string())),
        }
    }

    pub fn from_writer(writer: Box<dyn Write + Send>, format: Format) -> OutputSink {
        OutputSink::new(writer, format, "custom writer".to_string())
    }

    fn new(writer: Box<dyn Write + Send>, format: Format, destination: String) -> OutputSink {
        OutputSink {
            writer,
            format,
            destination,
            header_written: false,
            failures: 0,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// writes one record; failures are logged and counted, never returned
    pub fn emit(&mut self, record: &dyn Record) {
        let line = match self.format {
            Format::Human => record.to_human(),
            Format::Tsv => {
                if !self.header_written {
                    self.header_written = true;
                    let header = record.tsv_header();
                    self.write_line(header);
                }
                record.to_tsv()
            },
            Format::Json => record.to_json().to_string(),
        };
        self.write_line(&line);
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.writer, "{}", line) {
            self.failures += 1;
            if self.failures == 1 {
                log::error!("unable to write to {}: {}", self.destination, e);
            } else {
                log::debug!("write to {} failed again ({} so far): {}", self.destination, self.failures, e);
            }
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::error!("unable to flush {}: {}", self.destination, e);
        }
    }
}
impl Drop for OutputSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);
    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn echo(sequence: u32) -> EchoRecord {
        let sent = Timestamp::new(10, 500_000_000);
        let arrival = Timestamp::new(11, 900_000);
        EchoRecord {
            arrival,
            sequence,
            size: 64,
            rtt: arrival.round_trip_since(&sent),
        }
    }

    #[test]
    fn tsv_header_is_written_once() {
        let captured = Captured::default();
        let mut sink = OutputSink::from_writer(Box::new(captured.clone()), Format::Tsv);
        sink.emit(&echo(0));
        sink.emit(&echo(1));
        let text = captured.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "arrival\tsequence\tsize\trtt");
        assert_eq!(lines[1], "11.000900000\t0\t64\t0.500900000");
        assert!(lines[2].starts_with("11.000900000\t1\t"));
    }

    #[test]
    fn json_lines_parse_back() {
        let captured = Captured::default();
        let mut sink = OutputSink::from_writer(Box::new(captured.clone()), Format::Json);
        sink.emit(&ArrivalRecord {
            kernel_time: None,
            user_time: Timestamp::new(5, 1),
            source: "127.0.0.1:9000".parse().unwrap(),
            sequence: 7,
            size: 21,
            echoed: true,
        });
        let value: serde_json::Value = serde_json::from_str(captured.text().trim()).unwrap();
        assert_eq!(value["kind"], "arrival");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["kernel_time"], serde_json::Value::Null);
        assert_eq!(value["user_time"]["nanos"], 1);
        assert_eq!(value["echoed"], true);
    }

    #[test]
    fn unwritable_path_is_an_output_error() {
        let result = OutputSink::open(Some(Path::new("/nonexistent-directory/records.tsv")), Format::Tsv);
        assert!(matches!(result, Err(ProbeError::OutputSink(_))));
    }
}
