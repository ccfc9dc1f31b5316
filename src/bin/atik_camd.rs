// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tonic::transport::Server;
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use atik_camd::acquisition_engine::SequenceTiming;
use atik_camd::artemis_sdk::ArtemisSdk;
use atik_camd::camd::camd_server::CamdServer;
use atik_camd::camd_service::CamdService;
use atik_camd::camera_controller::{CameraController, CameraState};
use atik_camd::camera_sdk::CameraSdk;
use atik_camd::config::DaemonConfig;
use atik_camd::pipeline_notifier::GrpcFrameNotifier;
use atik_camd::sim_sdk::SimulatedSdk;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// JSON configuration file.
    config: PathBuf,

    /// Drive a simulated camera instead of loading the Artemis SDK.
    #[arg(long)]
    simulate: bool,

    /// Directory for the log file, which is named after the configured
    /// log_name.
    #[arg(long, default_value = ".")]
    log_dir: String,
}

fn main() {
    let args = Args::parse();
    let config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e.message);
            std::process::exit(1);
        },
    };
    // Validated by DaemonConfig.
    let listen_address: SocketAddr = match config.listen_address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Bad listen_address: {}", e);
            std::process::exit(1);
        },
    };

    // Set up logging.
    let file_appender = tracing_appender::rolling::never(
        &args.log_dir, format!("{}.log", config.log_name));
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let _subscriber = registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        got_signal2.store(true, AtomicOrdering::Relaxed);
    }) {
        error!("Could not install signal handler: {}", e);
        std::process::exit(1);
    }

    let sdk: Box<dyn CameraSdk> = if args.simulate {
        info!("Using simulated camera at {}", config.usb_port_path());
        Box::new(SimulatedSdk::new(config.usb_port_path()))
    } else {
        match ArtemisSdk::load() {
            Ok(sdk) => Box::new(sdk),
            Err(e) => {
                error!("{}", e.message);
                std::process::exit(1);
            },
        }
    };
    let notifier = match GrpcFrameNotifier::new(&config.pipeline_address) {
        Ok(notifier) => notifier,
        Err(e) => {
            error!("{}", e.message);
            std::process::exit(1);
        },
    };
    let controller = Arc::new(CameraController::new(
        &config, sdk, Box::new(notifier), env!("CARGO_PKG_VERSION"),
        SequenceTiming::default()));
    let service = CamdService::new(controller.clone(), config.control_machines.clone());

    info!("Camera {} daemon listening at {}", config.camera_id, listen_address);
    async_main(listen_address, service, got_signal);

    if controller.camera_state() != CameraState::Disabled {
        info!("Shutting down camera");
        controller.shutdown();
    }
    info!("Exiting");
}

#[tokio::main]
async fn async_main(listen_address: SocketAddr, service: CamdService,
                    got_signal: Arc<AtomicBool>) {
    let shutdown = async move {
        while !got_signal.load(AtomicOrdering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    if let Err(e) = Server::builder()
        .add_service(CamdServer::new(service))
        .serve_with_shutdown(listen_address, shutdown).await
    {
        error!("Server error: {}", e);
    }
}
