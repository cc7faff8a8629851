//! tts-gateway - unified CLI
//!
//! A single binary providing:
//! - `serve` - Run the WebSocket gateway (default)
//! - `synthesize` - Run the engine once and write a WAV file
//! - `sweep` - Delete expired artifacts once
//!
//! Usage:
//!   tts-gateway serve --port 8000 --model voices/en_US-lessac-medium.onnx
//!   tts-gateway synthesize --text "Hello world" --output hello.wav
//!   tts-gateway sweep --audio-dir temporary_audio_files --max-age-secs 600

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tts_gateway::{
    cli_style::{
        print_box, print_error, print_info, print_section, print_server_startup,
        print_success, print_sweep_report,
    },
    config::{init_tracing, load_dotenv, Cli, Commands, ServeArgs, SweepArgs, SynthesizeArgs},
    protocol::SynthesisRequest,
    server::{self, AppState},
    store::ArtifactStore,
    sweeper::{RetentionConfig, RetentionSweeper},
    synthesis::{SynthesisJobRunner, Synthesizer},
};

/// Main entry point with subcommand dispatch
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command_or_serve() {
        Commands::Serve(args) => run_server(args).await,
        Commands::Synthesize(args) => run_synthesize(args).await,
        Commands::Sweep(args) => run_sweep(args).await,
    }
}

/// Run the gateway until Ctrl+C or SIGTERM
async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.gateway_config();
    if let Err(e) = config.validate() {
        print_error(&format!("Invalid configuration: {}", e));
        return Err(e.into());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting tts gateway"
    );

    let store = match ArtifactStore::open(&config.audio_dir).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "cannot prepare working directory");
            print_error(&e.to_string());
            return Err(e.into());
        }
    };

    let runner = SynthesisJobRunner::new(
        store.clone(),
        config.engine.clone(),
        config.max_concurrent_jobs,
    );
    let state = AppState::new(store.clone(), Arc::new(runner));

    let addr = config.bind_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => {
            info!(address = %addr, "server bound to address");
            l
        }
        Err(e) => {
            error!(address = %addr, error = %e, "failed to bind to address");
            return Err(e.into());
        }
    };

    print_server_startup(&config);

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = RetentionSweeper::new(store, config.retention).spawn(stopped(stop_rx.clone()));

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    info!("server ready - accepting connections");
    let served = server::serve_with_shutdown(listener, state, stopped(stop_rx)).await;

    if let Err(e) = sweeper.await {
        warn!(error = %e, "retention sweeper task failed");
    }
    if let Err(e) = served {
        error!(error = %e, "server error");
        return Err(e);
    }

    info!("server exited cleanly");
    Ok(())
}

/// Resolves once the stop flag is raised (or its sender is gone)
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Run the engine once and copy the result to `--output`
async fn run_synthesize(args: SynthesizeArgs) -> Result<(), Box<dyn std::error::Error>> {
    print_section("Synthesize");

    let store = ArtifactStore::open(&args.audio_dir).await?;
    let runner = SynthesisJobRunner::new(store, args.engine.engine_config(), 1);

    let mut request = SynthesisRequest::new(args.text.clone());
    if let Some(voice) = &args.voice {
        request = request.with_voice(voice.clone());
    }

    print_info(&format!("Running {}", runner.engine().program.display()));
    let started = Instant::now();
    let artifact = match runner.synthesize(request).await {
        Ok(artifact) => artifact,
        Err(e) => {
            print_error(&format!("Synthesis failed: {}", e));
            return Err(e.into());
        }
    };
    let elapsed = started.elapsed();

    tokio::fs::copy(&artifact.path, &args.output).await?;
    if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
        warn!(artifact = %artifact.path.display(), error = %e, "could not remove scratch artifact");
    }

    let mut rows = vec![
        ("Output", args.output.display().to_string()),
        ("Elapsed", format!("{} ms", elapsed.as_millis())),
    ];
    match inspect_wav(&args.output) {
        Ok(summary) => rows.extend(summary.rows()),
        Err(e) => warn!(output = %args.output.display(), error = %e, "output is not a readable WAV file"),
    }
    print_box("Synthesis Result", &rows);
    print_success(&format!("Saved to {}", args.output.display()));
    Ok(())
}

/// Delete expired artifacts once
async fn run_sweep(args: SweepArgs) -> Result<(), Box<dyn std::error::Error>> {
    print_section("Retention Sweep");

    let store = ArtifactStore::open(&args.audio_dir).await?;
    let sweeper = RetentionSweeper::new(
        store,
        RetentionConfig {
            max_age: Duration::from_secs(args.max_age_secs),
            ..RetentionConfig::default()
        },
    );
    print_info(&format!(
        "Deleting artifacts older than {}s in {}",
        sweeper.config().max_age.as_secs(),
        args.audio_dir.display()
    ));
    let report = sweeper.sweep_once().await;
    print_sweep_report(&report);
    if report.failures.is_empty() {
        print_success("Sweep complete");
    }
    Ok(())
}

/// Properties of a WAV file
#[derive(Debug, Clone, PartialEq)]
struct WavSummary {
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    frames: u32,
}

impl WavSummary {
    fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate.max(1) as f64
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Sample rate", format!("{} Hz", self.sample_rate)),
            ("Channels", self.channels.to_string()),
            ("Bits", self.bits_per_sample.to_string()),
            ("Duration", format!("{:.2} s", self.duration_secs())),
        ]
    }
}

fn inspect_wav(path: &Path) -> Result<WavSummary, hound::Error> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    Ok(WavSummary {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
        frames: reader.duration(),
    })
}

/// Create a future that resolves on shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["tts-gateway", "serve", "--port", "8888"]);
        assert!(matches!(cli.command_or_serve(), Commands::Serve(args) if args.port == 8888));
    }

    #[test]
    fn test_inspect_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inspect.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..22050 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let summary = inspect_wav(&path).unwrap();
        assert_eq!(summary.sample_rate, 22050);
        assert_eq!(summary.channels, 1);
        assert_eq!(summary.frames, 22050);
        assert!((summary.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_inspect_rejects_non_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.wav");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(inspect_wav(&path).is_err());
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_flag() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(stopped(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
