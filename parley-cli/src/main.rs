//! `parley` command-line host.
//!
//! Stands in for the network transport of a voice assistant: `record` carries
//! captured frames out as base64 lines, `play` feeds base64 lines (or a WAV
//! file) into the playback queue, and `loopback` wires one into the other.

mod commands;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use settings::{default_settings_path, load_settings};

const DEFAULT_LOG_FILTER: &str = "parley=info,parley_core=info";

/// Parley - real-time voice capture and gapless playback
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Settings file (defaults to the user data directory)
    #[arg(long, env = "PARLEY_SETTINGS")]
    settings: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List audio input and output devices
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Capture the microphone and write one base64 PCM16 chunk per line
    Record {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        seconds: f64,
        /// Write chunks here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write a 16 kHz WAV copy
        #[arg(long)]
        wav: Option<PathBuf>,
        /// Input device name (overrides settings)
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Play base64 PCM16 lines (24 kHz) or a WAV file
    Play {
        input: PathBuf,
        /// Output volume in [0, 1] (overrides settings)
        #[arg(long)]
        volume: Option<f32>,
    },
    /// Route the microphone through the codec to the speakers
    Loopback {
        /// Duration in seconds
        #[arg(short, long, default_value = "10")]
        seconds: f64,
        #[arg(short, long)]
        device: Option<String>,
        #[arg(long)]
        volume: Option<f32>,
    },
    /// Update and print the saved settings
    Settings {
        #[arg(long)]
        input_device: Option<String>,
        #[arg(long)]
        volume: Option<f32>,
        #[arg(long)]
        block_size: Option<usize>,
    },
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        1 => EnvFilter::new("parley=debug,parley_core=debug"),
        _ => EnvFilter::new("parley=trace,parley_core=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    info!(path = %settings_path.display(), "settings loaded");

    match cli.command {
        Command::Devices { json } => commands::devices(json),
        Command::Record {
            seconds,
            output,
            wav,
            device,
        } => {
            settings.apply_env_overrides();
            if device.is_some() {
                settings.preferred_input_device = device;
                settings.normalize();
            }
            commands::record(&settings, seconds, output.as_deref(), wav.as_deref())
        }
        Command::Play { input, volume } => {
            settings.apply_env_overrides();
            if let Some(volume) = volume {
                settings.volume = volume;
                settings.normalize();
            }
            commands::play(&settings, &input)
        }
        Command::Loopback {
            seconds,
            device,
            volume,
        } => {
            settings.apply_env_overrides();
            if device.is_some() {
                settings.preferred_input_device = device;
            }
            if let Some(volume) = volume {
                settings.volume = volume;
            }
            settings.normalize();
            commands::loopback(&settings, seconds)
        }
        Command::Settings {
            input_device,
            volume,
            block_size,
        } => commands::save(&settings_path, settings, input_device, volume, block_size),
    }
}
