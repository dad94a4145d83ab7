// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::{crate_version, Parser, Subcommand};
use duration_string::DurationString;
use sampledeck::{audio, config::Audio, samples::SampleStore, AudioEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How often the CLI checks whether playback has finished.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A real-time sample mixer."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Decodes WAV files and prints their format.
    Info {
        /// The WAV files to inspect.
        paths: Vec<PathBuf>,
    },
    /// Plays WAV files through the configured device.
    Play {
        /// The path to the audio config.
        config_path: PathBuf,
        /// The WAV files to play. They start together.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Loop every file until the duration passes.
        #[arg(short, long = "loop")]
        looping: bool,
        /// Stop after this long, e.g. 5s.
        #[arg(short, long)]
        duration: Option<String>,
    },
    /// Plays a sine tone generated by the synth hook.
    Tone {
        /// The path to the audio config.
        config_path: PathBuf,
        /// The tone frequency in Hz.
        #[arg(short, long, default_value_t = 440.0)]
        frequency: f64,
        /// How long to play the tone.
        #[arg(short, long, default_value = "2s")]
        duration: String,
    },
}

fn parse_duration(duration: &str) -> Result<Duration, Box<dyn Error>> {
    Ok(DurationString::from_string(duration.to_string())
        .map_err(|e| format!("invalid duration {}: {}", duration, e))?
        .into())
}

fn start_engine(config_path: &Path) -> Result<(AudioEngine, Audio), Box<dyn Error>> {
    let config = Audio::deserialize(config_path)?;
    let mut engine = AudioEngine::new();
    engine.initialize_from_config(&config)?;
    Ok((engine, config))
}

fn main() -> Result<(), Box<dyn Error>> {
    // Logs go to stderr so PCM piped to stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Info { paths } => {
            let store = SampleStore::new();
            for path in paths {
                match store.load_file(&path) {
                    Ok(id) => {
                        if let Some(sample) = store.get(id) {
                            println!(
                                "{}: channels={} frames={} duration={:?}",
                                path.display(),
                                sample.channel_count(),
                                sample.frame_count(),
                                sample.duration()
                            );
                        }
                    }
                    Err(e) => println!("{}: {}", path.display(), e),
                }
            }
        }
        Commands::Play {
            config_path,
            paths,
            looping,
            duration,
        } => {
            let limit = duration.as_deref().map(parse_duration).transpose()?;
            let (mut engine, config) = start_engine(&config_path)?;

            let ids = paths
                .iter()
                .map(|path| engine.load_sample_file(path))
                .collect::<Result<Vec<_>, _>>()?;

            spin_sleep::sleep(config.playback_delay()?);
            let started = Instant::now();
            for id in ids {
                engine.play_sample(id, looping);
            }

            while engine.active_instances() > 0 {
                if limit.is_some_and(|limit| started.elapsed() >= limit) {
                    engine.stop_all();
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }

            let stats = engine.stats();
            engine.destroy();
            if let Some(stats) = stats {
                info!(
                    blocks = stats.blocks_delivered,
                    underruns = stats.underruns,
                    "Playback finished"
                );
            }
        }
        Commands::Tone {
            config_path,
            frequency,
            duration,
        } => {
            let duration = parse_duration(&duration)?;
            let (mut engine, _) = start_engine(&config_path)?;

            engine.set_synth_hook(move |_, clock, _| {
                (0.25 * (TAU * frequency * clock).sin()) as f32
            });
            thread::sleep(duration);
            engine.destroy();
        }
    }

    Ok(())
}
