//! Cadence CLI - The `cadence` command.
//!
//! A metronome built on the cadence clock. It can render a click track
//! offline, printing every tick with its musical position, or play one in
//! real time.

mod metronome;
mod play;
mod render;

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Cadence - tempo-aware metronome
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A tempo-aware metronome and clock", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a click track offline and print every tick
    Render(RenderArgs),

    /// Play a click track in real time
    Play(PlayArgs),

    /// Show version information
    Version,
}

/// Options shared by every metronome command.
#[derive(ClapArgs, Debug, Clone)]
pub struct MetronomeArgs {
    /// Clock configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Tempo in beats per minute (overrides the config file)
    #[arg(short, long)]
    pub bpm: Option<f64>,

    /// Time signature such as 3/4 (overrides the config file)
    #[arg(short, long)]
    pub signature: Option<String>,

    /// Tempo change at a beat, as BEAT:BPM (repeatable)
    #[arg(long = "tempo-at", value_name = "BEAT:BPM")]
    pub tempo_changes: Vec<String>,

    /// Signature change at a measure, as MEASURE:SIGNATURE (repeatable)
    #[arg(long = "meter-at", value_name = "MEASURE:SIGNATURE")]
    pub meter_changes: Vec<String>,
}

#[derive(ClapArgs, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub metronome: MetronomeArgs,

    /// Number of ticks to render
    #[arg(short = 'n', long, default_value_t = 16)]
    pub ticks: u32,
}

#[derive(ClapArgs, Debug)]
pub struct PlayArgs {
    #[command(flatten)]
    pub metronome: MetronomeArgs,

    /// How long to play, e.g. "8s"
    #[arg(short, long, default_value = "8s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Longest single wait of the clock thread, e.g. "1ms"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub slop: Option<Duration>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Render(render_args) => render::render(render_args),
        Commands::Play(play_args) => play::play(play_args),
        Commands::Version => {
            println!("cadence {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Tempo-aware scheduling in seconds, beats and measures");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_render_args() {
        let args = Args::parse_from([
            "cadence",
            "render",
            "--bpm",
            "90",
            "--signature",
            "3/4",
            "--tempo-at",
            "8:120",
            "--meter-at",
            "3:7/8",
            "-n",
            "4",
        ]);
        let Commands::Render(render) = args.command else {
            panic!("expected render");
        };
        assert_eq!(render.ticks, 4);
        assert_eq!(render.metronome.bpm, Some(90.0));
        assert_eq!(render.metronome.tempo_changes, vec!["8:120"]);
        assert_eq!(render.metronome.meter_changes, vec!["3:7/8"]);
    }

    #[test]
    fn test_parse_play_durations() {
        let args = Args::parse_from(["cadence", "play", "--duration", "2s", "--slop", "500us"]);
        let Commands::Play(play) = args.command else {
            panic!("expected play");
        };
        assert_eq!(play.duration, Duration::from_secs(2));
        assert_eq!(play.slop, Some(Duration::from_micros(500)));
    }
}
