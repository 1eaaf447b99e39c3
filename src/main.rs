use clap::Parser;

use udprobe::args::Args;
use udprobe::error::{ProbeError, EXIT_FORCED, EXIT_INVALID};
use udprobe::protocol::results::OutputSink;
use udprobe::utils::shutdown::ShutdownToken;
use udprobe::{client, server};

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            //usage problems are configuration errors like any other
            let code = if e.use_stderr() { EXIT_INVALID } else { 0 };
            e.print().unwrap_or_default();
            std::process::exit(code);
        },
    };

    let env = env_logger::Env::default().filter_or("RUST_LOG", args.log_level());
    env_logger::init_from_env(env);

    let shutdown = ShutdownToken::new();
    let c_shutdown = shutdown.clone();
    log::debug!("registering SIGINT handler...");
    if let Err(e) = ctrlc::set_handler(move || {
        if c_shutdown.cancel() {
            log::warn!("shutdown requested; please allow a moment for the session to stop");
        } else {
            log::warn!("forcing shutdown immediately");
            std::process::exit(EXIT_FORCED);
        }
    }) {
        log::warn!("unable to set SIGINT handler: {}", e);
    }

    if let Err(e) = run(&args, &shutdown) {
        log::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(args: &Args, shutdown: &ShutdownToken) -> Result<(), ProbeError> {
    match (&args.client, args.server) {
        (Some(host), false) => {
            let config = args.client_config(host)?;
            let sink = OutputSink::open(args.output.as_deref(), args.format)?;
            log::debug!("beginning client session...");
            client::run_client(&config, sink, shutdown)?;
        },
        (None, true) => {
            let config = args.server_config()?;
            let mut sink = OutputSink::open(args.output.as_deref(), args.format)?;
            log::debug!("beginning normal operation...");
            server::run_server(&config, &mut sink, shutdown)?;
        },
        _ => {
            return Err(ProbeError::Configuration(
                "exactly one of --server or --client is required".to_string(),
            ))
        },
    }
    Ok(())
}
