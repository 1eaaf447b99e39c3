use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ProbeError;
use crate::generator::runtime::GeneratorRuntime;
use crate::generator::{self, DEFAULT_GENERATOR};
use crate::protocol::header;
use crate::protocol::results::OutputSink;
use crate::stream::echo::EchoReceiver;
use crate::stream::sender::{Schedule, Session, SessionReport};
use crate::stream::socket::{self, SocketBuffers};
use crate::utils::clock::{log_resolution, Clock, ClockSource, SystemClock};
use crate::utils::cpu_affinity::CpuAffinityManager;
use crate::utils::realtime::{enter_real_time, report_page_faults, PageFaults, CLIENT_PRIORITY_OFFSET};
use crate::utils::shutdown::ShutdownToken;

/// how long to keep listening for echoes after the last packet, by default
pub const DEFAULT_ECHO_LINGER: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// resolved server addresses; the first one a socket can be connected to is used
    pub addresses: Vec<SocketAddr>,
    pub schedule: Schedule,
    /// the clock deadlines (and any start time) are measured on
    pub clock: ClockSource,
    pub echo: bool,
    pub echo_linger: Duration,
    pub generator: String,
    pub generator_options: Option<String>,
    pub real_time: bool,
    pub affinity: String,
    pub buffers: SocketBuffers,
}
impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            addresses: Vec::new(),
            schedule: Schedule::default(),
            clock: ClockSource::default(),
            echo: false,
            echo_linger: DEFAULT_ECHO_LINGER,
            generator: DEFAULT_GENERATOR.to_string(),
            generator_options: None,
            real_time: false,
            affinity: String::new(),
            buffers: SocketBuffers::default(),
        }
    }
}

/// runs one timed sending session against a server
///
/// records (round-trip times, if echo is on) go to `sink`; the returned report summarises
/// the session. a generator that falls behind ends the session with `BufferUnderrun`
pub fn run_client(config: &ClientConfig, sink: OutputSink, shutdown: &ShutdownToken) -> Result<SessionReport, ProbeError> {
    let generator = generator::create(&config.generator, config.generator_options.as_deref())?;
    let mut cpu_affinity_manager = CpuAffinityManager::new(&config.affinity)?;

    log::debug!("connecting to {:?}...", config.addresses);
    let socket = Arc::new(
        socket::connect(&config.addresses, &config.buffers).map_err(|e| ProbeError::NetworkSetup(e.to_string()))?,
    );

    if config.real_time {
        enter_real_time(CLIENT_PRIORITY_OFFSET);
    }
    log_resolution(config.clock);

    let runtime = GeneratorRuntime::spawn(generator, cpu_affinity_manager.next_core())?;
    let outcome = drive_session(config, &runtime, &socket, sink, &mut cpu_affinity_manager, shutdown);
    //everything that touched the ring has let go of it by now
    let teardown = runtime.shutdown();
    drop(socket); //closed last, once nothing reads from it

    let report = match (outcome, teardown) {
        (Ok(report), Ok(())) => report,
        (Ok(_), Err(e)) => return Err(e),
        (Err(e), teardown) => {
            if let Err(teardown_error) = teardown {
                log::error!("generator teardown also failed: {}", teardown_error);
            }
            return Err(e);
        },
    };

    log::info!("session finished: {}", report);
    if report.underrun {
        return Err(ProbeError::BufferUnderrun {
            sequence: report.last_sequence.unwrap_or(0),
        });
    }
    Ok(report)
}

fn drive_session(
    config: &ClientConfig,
    runtime: &GeneratorRuntime,
    socket: &Arc<UdpSocket>,
    sink: OutputSink,
    cpu_affinity_manager: &mut CpuAffinityManager,
    shutdown: &ShutdownToken,
) -> Result<SessionReport, ProbeError> {
    let prepared = runtime.wait_ready()?;
    let mut staged_packet = header::stage_packet(prepared.max_size, config.echo)?;

    let echo = if config.echo {
        let receiver = EchoReceiver::spawn(
            Arc::clone(socket),
            sink,
            prepared.max_size,
            config.real_time,
            cpu_affinity_manager.next_core(),
        )?;
        receiver.wait_ready()?;
        Some(receiver)
    } else {
        drop(sink); //nothing else produces records on the client
        None
    };

    let clock = SystemClock::new(config.clock);
    if let Some(start) = config.schedule.start {
        if start < clock.now() {
            log::warn!("start time {} has already passed; early packets will go out back-to-back", start);
        }
    }
    let refill = runtime.refill_handle();
    cpu_affinity_manager.set_affinity("sender");

    log::info!(
        "sending with generator {} for {:?} on the {} clock",
        config.generator,
        config.schedule.duration,
        config.clock
    );
    let faults_before = PageFaults::sample();
    let mut report = Session {
        ring: &prepared.ring,
        refill: &refill,
        clock: &clock,
        socket: socket.as_ref(),
        shutdown,
    }
    .run(&config.schedule, &mut staged_packet);
    report_page_faults(faults_before, PageFaults::sample());
    drop(refill);
    drop(prepared);

    if let Some(receiver) = echo {
        let (received, _sink) = receiver.finish(report.packets_sent, config.echo_linger)?;
        report.echoes_received = received;
    }
    Ok(report)
}
