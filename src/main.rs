//! Loopsync - round-trip audio capture and synchronized rendering
//!
//! Entry point for the command-line tool.

use anyhow::{Context, Result};
use loopsync::audio::device::{list_devices, CpalDuplexGraph};
use loopsync::audio::signal::ToneBurst;
use loopsync::audio::wavio::write_audio_file;
use loopsync::config::AppConfig;
use loopsync::session::load_reference;
use loopsync::{LatencyRun, RunReport};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// What the command line asked for
enum Command {
    Run,
    List,
    GenerateReference(PathBuf),
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("loopsync=info".parse()?)
                .add_directive("loopsync_core=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = AppConfig::load();
    let mut command = Command::Run;
    let mut save_config = false;
    let mut i = 1;

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--list" | "-l" => command = Command::List,
            "--version" | "-v" => {
                println!("loopsync {} ({})", loopsync::VERSION, loopsync::BUILD_DATE);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--save-config" => save_config = true,
            "--abort-on-inconsistent" => config.abort_on_inconsistent = true,
            "--device" | "-d" | "--input-device" | "-i" | "--sample-rate" | "-r" | "--duration" | "--delay"
            | "--buffer-size" | "--reference" | "--out-dir" | "-o" | "--generate-reference" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("Error: {} requires a value", flag);
                    return Ok(());
                };
                if let Err(e) = apply_option(&mut config, &mut command, flag, value) {
                    eprintln!("Error: {}", e);
                    return Ok(());
                }
                i += 2;
                continue;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
        }
        i += 1;
    }

    if save_config {
        config.save(&AppConfig::path())?;
    }

    match command {
        Command::List => print_devices(),
        Command::GenerateReference(path) => generate_reference(&config, &path),
        Command::Run => run(&config),
    }
}

fn apply_option(
    config: &mut AppConfig,
    command: &mut Command,
    flag: &str,
    value: &str,
) -> Result<()> {
    match flag {
        "--device" | "-d" => config.device = Some(value.to_string()),
        "--input-device" | "-i" => config.input_device = Some(value.to_string()),
        "--sample-rate" | "-r" => {
            config.sample_rate = value
                .parse()
                .with_context(|| format!("Invalid sample rate: {}", value))?
        }
        "--duration" => {
            config.capture_secs = value
                .parse()
                .with_context(|| format!("Invalid duration: {}", value))?
        }
        "--delay" => {
            config.startup_delay_secs = value
                .parse()
                .with_context(|| format!("Invalid delay: {}", value))?
        }
        "--buffer-size" => {
            config.buffer_size_frames = Some(
                value
                    .parse()
                    .with_context(|| format!("Invalid buffer size: {}", value))?,
            )
        }
        "--reference" => config.reference_path = Some(PathBuf::from(value)),
        "--out-dir" | "-o" => config.output_dir = PathBuf::from(value),
        "--generate-reference" => *command = Command::GenerateReference(PathBuf::from(value)),
        _ => anyhow::bail!("Unknown option: {}", flag),
    }
    Ok(())
}

fn print_help() {
    println!("Usage: loopsync [OPTIONS]");
    println!();
    println!("Plays a reference through the audio device, records the output and input");
    println!("taps, and renders them aligned into one stereo file.");
    println!();
    println!("Options:");
    println!("  -l, --list                     List available audio devices");
    println!("  -d, --device NAME              Output device (default: host default output)");
    println!("  -i, --input-device NAME        Input device (default: output device if it records,");
    println!("                                 else host default input)");
    println!("  -r, --sample-rate RATE         Sample rate of a generated reference (default: 48000)");
    println!("      --duration SECS            Capture length (default: 2.0)");
    println!("      --delay SECS               Delay before the reference starts (default: 0.1)");
    println!("      --buffer-size FRAMES       Request a fixed hardware buffer size");
    println!("      --reference PATH           Reference WAV file (default: generated tone burst)");
    println!("  -o, --out-dir DIR              Directory for recordings and result");
    println!("      --generate-reference PATH  Write the default tone burst to PATH and exit");
    println!("      --abort-on-inconsistent    Skip rendering when latency figures don't add up");
    println!("      --save-config              Remember these options");
    println!("  -v, --version                  Show version");
    println!("  -h, --help                     Show this help");
    println!();
    println!("Config: {}", AppConfig::path().display());
}

fn print_devices() -> Result<()> {
    println!("Scanning for audio devices...");
    println!();

    match list_devices() {
        Ok(devices) if devices.is_empty() => {
            println!("No audio devices found.");
        }
        Ok(devices) => {
            println!("Found {} device(s):", devices.len());
            println!();
            for (i, device) in devices.iter().enumerate() {
                let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
                println!("  {}. {}{}", i + 1, device.name, default_marker);
                println!(
                    "     Channels: {} in, {} out",
                    device.input_channels, device.output_channels
                );
                if !device.sample_rates.is_empty() {
                    println!("     Sample rates: {:?}", device.sample_rates);
                }
                println!();
            }
        }
        Err(e) => {
            error!("Failed to list devices: {}", e);
            println!("Error: {}", e);
        }
    }

    Ok(())
}

fn generate_reference(config: &AppConfig, path: &std::path::Path) -> Result<()> {
    let reference = ToneBurst::new(config.sample_rate).render();
    write_audio_file(path, &reference)?;
    println!(
        "Reference written: {} ({} frames at {} Hz)",
        path.display(),
        reference.frame_len(),
        reference.sample_rate()
    );
    Ok(())
}

fn run(config: &AppConfig) -> Result<()> {
    let reference = match &config.reference_path {
        Some(path) => load_reference(path)?,
        None => {
            info!(sample_rate = config.sample_rate, "Using generated tone burst");
            Arc::new(ToneBurst::new(config.sample_rate).render())
        }
    };

    let mut graph = CpalDuplexGraph::new(config.device.as_deref(), config.input_device.as_deref())?
        .with_buffer_size(config.buffer_size_frames)
        .with_latency_overrides(config.latency);
    println!("Output device: {}", graph.output_device_name());
    println!("Input device:  {}", graph.input_device_name());

    // Set up Ctrl+C handler
    let cancel = Arc::new(AtomicBool::new(false));
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        c.store(true, Ordering::SeqCst);
    })
    .ok();

    println!(
        "Capturing {:.1}s into {}. Press Ctrl+C to stop early.",
        config.capture_secs,
        config.output_dir.display()
    );

    let run = LatencyRun::new(config.run_config());
    match run.run(&mut graph, reference, &cancel) {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Latency run failed");
            Err(e.into())
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!(
        "Buffers: {} out / {} in frames",
        report.profile.output_buffer_size_frames, report.profile.input_buffer_size_frames
    );
    println!("Sync plan ({} Hz):", report.sample_rate);
    println!("  Reference start:  {:>8}", report.plan.reference_start_frame);
    println!("  Output tap start: {:>8}", report.plan.output_start_frame);
    println!("  Input tap start:  {:>8}", report.plan.input_start_frame);
    println!("  Round trip:       {:>8.2} ms", report.round_trip_ms);
    if let Some(skew) = report.timing.tap_skew_secs() {
        println!("  Tap skew:         {:>8.2} ms", skew * 1000.0);
    }
    if let Some(warning) = &report.latency_warning {
        println!();
        println!("Warning: {}", warning);
    }
    println!();
    println!("Result: {}", report.result_path.display());
}
