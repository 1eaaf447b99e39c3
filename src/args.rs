use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientConfig;
use crate::error::ProbeError;
use crate::protocol::results::Format;
use crate::server::ServerConfig;
use crate::stream::sender::Schedule;
use crate::stream::socket::{resolve, AddressFamily, SocketBuffers};
use crate::utils::clock::{ClockSource, Timestamp};

/// udprobe, measures UDP jitter, loss and round-trip latency under synthetic,
/// precisely-timed load
#[derive(clap::Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// run in server mode
    #[arg(short, long, conflicts_with = "client")]
    pub server: bool,

    /// run in client mode; value is the server's address
    #[arg(short, long, value_name = "host", conflicts_with = "server")]
    pub client: Option<String>,

    /// the UDP port the server listens on
    #[arg(short, long, value_name = "number", default_value_t = 4567)]
    pub port: u16,

    /// only use IPv4 addresses
    #[arg(short = '4', long, conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// only use IPv6 addresses; a server bound to :: accepts only IPv6
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// bind the server to the interface associated with the address <host>
    #[arg(short = 'B', long, value_name = "host", conflicts_with = "client")]
    pub bind: Option<String>,

    /// the format in which to write records
    #[arg(short, long, value_enum, value_name = "format", default_value_t = Format::Human)]
    pub format: Format,

    /// write records to this file instead of standard output
    #[arg(short, long, value_name = "path")]
    pub output: Option<PathBuf>,

    /// the time in seconds for which to transmit
    #[arg(short, long, default_value = "1.0", value_name = "seconds", conflicts_with = "server")]
    pub time: f64,

    /// stop after this many packets, even if time remains
    #[arg(short = 'n', long, value_name = "packets", conflicts_with = "server")]
    pub count: Option<u64>,

    /// the traffic model: static, alternate, random or gaussian
    #[arg(short, long, value_name = "name", default_value = "static", conflicts_with = "server")]
    pub generator: String,

    /// generator options, as name=value pairs delimited by commas (for example size=64,interval=1000)
    #[arg(short = 'a', long, value_name = "options", conflicts_with = "server")]
    pub generator_args: Option<String>,

    /// ask the server to send every packet back, and record round-trip times
    #[arg(short, long, conflicts_with = "server")]
    pub echo: bool,

    /// milliseconds to keep waiting for echoes after the last packet is sent
    #[arg(long, default_value_t = 250, value_name = "ms", conflicts_with = "server")]
    pub echo_linger: u64,

    /// begin sending at this UNIX time, in seconds; implies the realtime clock
    #[arg(long, value_name = "seconds", conflicts_with = "server")]
    pub start_time: Option<f64>,

    /// the clock packets are scheduled against (monotonic unless a start time is given)
    #[arg(long, value_enum, value_name = "clock", conflicts_with = "server")]
    pub clock: Option<ClockSource>,

    /// lock memory and run with real-time scheduling priority; usually requires privileges
    #[arg(short, long)]
    pub real_time: bool,

    /// specify logical CPUs, delimited by commas, across which to round-robin affinity;
    /// not supported on all systems
    #[arg(short = 'A', long, value_name = "numbers", default_value = "")]
    pub affinity: String,

    /// send buffer, in bytes (only supported on some platforms;
    /// if set too small, a 'resource unavailable' error may occur)
    #[arg(long, default_value = "0", value_name = "bytes")]
    pub send_buffer: usize,

    /// receive buffer, in bytes (only supported on some platforms;
    /// if set too small, a 'resource unavailable' error may occur)
    #[arg(long, default_value = "0", value_name = "bytes")]
    pub receive_buffer: usize,

    /// emit debug-level logging on stderr; default is info and above
    #[arg(short, long)]
    pub debug: bool,

    /// Verbosity level
    #[arg(short, long, value_name = "level", value_enum, default_value = "info")]
    pub verbosity: ArgVerbosity,
}

impl Args {
    fn family(&self) -> AddressFamily {
        if self.ipv4 {
            AddressFamily::V4
        } else if self.ipv6 {
            AddressFamily::V6
        } else {
            AddressFamily::Any
        }
    }

    fn buffers(&self) -> SocketBuffers {
        SocketBuffers {
            send: self.send_buffer,
            receive: self.receive_buffer,
        }
    }

    /// the scheduling clock and absolute start, if any
    fn timing(&self) -> Result<(ClockSource, Option<Timestamp>), ProbeError> {
        match self.start_time {
            None => Ok((self.clock.unwrap_or_default(), None)),
            Some(_) if self.clock == Some(ClockSource::Monotonic) => Err(ProbeError::Configuration(
                "a start time is a UNIX time and needs the realtime clock".to_string(),
            )),
            Some(start) if start.is_finite() && start >= 0.0 => {
                let secs = start.trunc();
                let nanos = ((start - secs) * 1e9).round() as u32;
                Ok((ClockSource::Realtime, Some(Timestamp::new(secs as i64, nanos))))
            },
            Some(start) => Err(ProbeError::Configuration(format!("invalid start time: {}", start))),
        }
    }

    pub fn client_config(&self, host: &str) -> Result<ClientConfig, ProbeError> {
        let duration = Duration::try_from_secs_f64(self.time)
            .map_err(|e| ProbeError::Configuration(format!("invalid duration {}: {}", self.time, e)))?;
        let (clock, start) = self.timing()?;
        let addresses =
            resolve(host, self.port, self.family()).map_err(|e| ProbeError::NetworkSetup(format!("{}: {}", host, e)))?;

        Ok(ClientConfig {
            addresses,
            schedule: Schedule {
                start,
                duration,
                count: self.count,
            },
            clock,
            echo: self.echo,
            echo_linger: Duration::from_millis(self.echo_linger),
            generator: self.generator.clone(),
            generator_options: self.generator_args.clone(),
            real_time: self.real_time,
            affinity: self.affinity.clone(),
            buffers: self.buffers(),
        })
    }

    pub fn server_config(&self) -> Result<ServerConfig, ProbeError> {
        let host = match &self.bind {
            Some(host) => host.as_str(),
            None if self.ipv6 => "::",
            None => "0.0.0.0",
        };
        let addresses =
            resolve(host, self.port, self.family()).map_err(|e| ProbeError::NetworkSetup(format!("{}: {}", host, e)))?;

        Ok(ServerConfig {
            addresses,
            ipv6_only: self.ipv6,
            buffers: self.buffers(),
            real_time: self.real_time,
            affinity: self.affinity.clone(),
        })
    }

    /// the default log filter, before RUST_LOG is consulted
    pub fn log_level(&self) -> String {
        if self.debug {
            ArgVerbosity::Debug.to_string()
        } else {
            self.verbosity.to_string()
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum ArgVerbosity {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for ArgVerbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgVerbosity::Off => write!(f, "off"),
            ArgVerbosity::Error => write!(f, "error"),
            ArgVerbosity::Warn => write!(f, "warn"),
            ArgVerbosity::Info => write!(f, "info"),
            ArgVerbosity::Debug => write!(f, "debug"),
            ArgVerbosity::Trace => write!(f, "trace"),
        }
    }
}
