//! trackmix CLI - renders raw audio files through the track mixing pipeline.

use clap::{Parser, Subcommand};

mod commands;

use commands::{MixCommand, PipelineCommand, PlayCommand};

/// trackmix CLI - drive the audio track mixer against a simulated device.
///
/// Every command runs offline: a simulated driver consumes hardware blocks
/// as fast as they are produced, and the rendered hardware stream is
/// written to a raw file.
///
/// Formats are written `encoding:rate:channels[:precision[:stride]]`,
/// for example `ulaw:8000:1` or `slinear_le:48000:2:16`.
#[derive(Parser)]
#[command(name = "trackmix")]
#[command(about = "Audio track mixing pipeline tool")]
#[command(version)]
pub struct Cli {
    /// Device config file (YAML)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render one raw file through a playback track
    Play(PlayCommand),
    /// Render several raw files through concurrent playback tracks
    Mix(MixCommand),
    /// Show the conversion stages a format needs
    Pipeline(PipelineCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .init();
    }

    match &cli.command {
        Commands::Play(cmd) => cmd.run(&cli),
        Commands::Mix(cmd) => cmd.run(&cli),
        Commands::Pipeline(cmd) => cmd.run(&cli),
    }
}
