use anyhow::{bail, Context, Result};
use crabframe::testing::{ScriptedBackend, Step};
use crabframe::{
    config::BackendKind, CrabFrameConfig, DeviceBackend, DeviceErrorCode, Frame, FrameProvider,
    FrameType, ProviderState,
};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "Usage: crabframe-cli [--config <path>] [--frames <n>] [--json]";

struct Options {
    config: PathBuf,
    frames: Option<u64>,
    json: bool,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options {
        config: CrabFrameConfig::default_path(),
        frames: None,
        json: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = args.get(i).context("--config needs a path")?;
                options.config = PathBuf::from(path);
            }
            "--frames" => {
                i += 1;
                let count = args.get(i).context("--frames needs a count")?;
                options.frames = Some(count.parse().context("invalid --frames")?);
            }
            "--json" => options.json = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => bail!("unknown argument: {}\n{}", other, USAGE),
        }
        i += 1;
    }
    Ok(options)
}

#[derive(Serialize)]
struct FrameLine<'a> {
    sequence: u64,
    timestamp: String,
    size: usize,
    frame_type: String,
    key_frame: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<bool>,
}

fn print_frame(frame: &Frame, json: bool) -> Result<()> {
    if !json {
        println!("{}", frame);
        return Ok(());
    }
    let line = FrameLine {
        sequence: frame.sequence,
        timestamp: frame.timestamp.to_rfc3339(),
        size: frame.size(),
        frame_type: frame.frame_type.to_string(),
        key_frame: frame.is_key_frame(),
        error: frame.error.as_ref().map(|e| e.cause.message.as_str()),
        expected: frame.error.as_ref().map(|e| e.expected),
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

/// A short run that exercises one unexpected error and one restart.
fn demo_backend() -> ScriptedBackend {
    let mut steps = Vec::new();
    steps.push(Step::Frame(FrameType::H264Idr));
    steps.extend(std::iter::repeat(Step::Frame(FrameType::H264P)).take(4));
    steps.push(Step::Error(DeviceErrorCode::Io));
    steps.push(Step::Frame(FrameType::H264P));
    steps.push(Step::Error(DeviceErrorCode::InterfaceDown));
    ScriptedBackend::with_steps(steps).acquire_delay(Duration::from_millis(33))
}

fn run<B: DeviceBackend>(
    backend: B,
    config: &CrabFrameConfig,
    options: &Options,
    interrupted: &AtomicBool,
) -> Result<()> {
    let provider = FrameProvider::with_settings(
        backend,
        config.stream.clone(),
        config.provider_settings(),
        config.classifier(),
    );
    let frames = provider.frames();
    provider.start().context("failed to start frame provider")?;

    let mut received = 0u64;
    while !interrupted.load(Ordering::SeqCst) {
        if options.frames.is_some_and(|limit| received >= limit) {
            break;
        }
        match frames.recv_timeout(Duration::from_secs(1)) {
            Ok(frame) => {
                received += 1;
                print_frame(&frame, options.json)?;
            }
            Err(_) => {
                if provider.state() == ProviderState::Error {
                    log::error!("Frame provider gave up after repeated restart failures");
                    break;
                }
            }
        }
    }

    provider.stop();
    let stats = provider.stats();
    if options.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        eprintln!(
            "state={} frames={} errors={} restarts={} restart_failures={}",
            stats.state,
            stats.frames_delivered,
            stats.errors_forwarded,
            stats.restarts,
            stats.restart_failures
        );
    }

    for (key, value) in &stats.device {
        log::debug!("device {} = {}", key, value);
    }
    if stats.terminal {
        bail!("stream stopped after {} failed restarts", stats.restart_retries);
    }
    Ok(())
}

fn main() -> Result<()> {
    crabframe::init_logging();

    let args: Vec<String> = env::args().collect();
    let options = parse_args(&args)?;
    let config = CrabFrameConfig::load_layered(&options.config)
        .with_context(|| format!("failed to load {}", options.config.display()))?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    match config.device.backend {
        BackendKind::Scripted => run(demo_backend(), &config, &options, &interrupted),
        #[cfg(all(feature = "v4l2", target_os = "linux"))]
        BackendKind::V4l2 => run(
            crabframe::V4l2Backend::new(&config.device.path),
            &config,
            &options,
            &interrupted,
        ),
        #[cfg(not(all(feature = "v4l2", target_os = "linux")))]
        BackendKind::V4l2 => bail!("crabframe-cli was built without the v4l2 feature"),
    }
}
