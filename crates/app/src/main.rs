use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use lipsync_motion_core::{
    motion::codec::MAGIC, AppConfig, BinaryMotionCodec, ExecutionContextRouter, WavDecoder,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> lipsync_motion_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            input,
            output,
            subject,
            config,
            no_optimize,
        } => run_generate(&input, &output, subject, config.as_deref(), no_optimize).await,
        Commands::Inspect { file } => run_inspect(&file),
    }
}

async fn run_generate(
    input: &Path,
    output: &Path,
    subject: Option<String>,
    config: Option<&Path>,
    no_optimize: bool,
) -> lipsync_motion_core::Result<()> {
    let mut config = match config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    if no_optimize {
        config.motion.optimize = false;
    }
    let subject = subject.unwrap_or_else(|| config.motion.model_name.clone());
    tracing::info!(?input, ?output, %subject, "generating lip sync motion");

    let pcm = WavDecoder.decode_sync(&std::fs::read(input)?)?;
    let router = ExecutionContextRouter::local(&config)?;
    let motion = router.generate_motion(pcm, &subject, false).await;
    router.shutdown().await;
    let motion = motion?;

    std::fs::write(output, &motion.vmd)?;
    tracing::info!(bytes = motion.vmd.len(), ?output, "motion written");
    Ok(())
}

fn run_inspect(file: &Path) -> lipsync_motion_core::Result<()> {
    let buffer = std::fs::read(file)?;
    let document = BinaryMotionCodec::deserialize(&buffer)?;

    println!("header:   {}", String::from_utf8_lossy(MAGIC));
    println!("model:    {}", document.model_name);
    println!("bones:    {}", document.bones.len());
    println!("morphs:   {}", document.morphs.len());
    println!("cameras:  {}", document.cameras.len());
    println!("lights:   {}", document.lights.len());
    println!("shadows:  {}", document.shadows.len());
    println!("frames:   {}", document.duration_frames());
    if !document.trailing.is_empty() {
        println!("trailing: {} bytes", document.trailing.len());
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Lip sync motion generator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse a WAV file and write mouth-shape motion for it.
    Generate {
        /// Speech audio to analyse.
        input: PathBuf,
        /// Destination motion file.
        output: PathBuf,
        /// Model name stored in the motion header.
        #[arg(short, long)]
        subject: Option<String>,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Keep every analysed frame instead of pruning redundant keyframes.
        #[arg(long)]
        no_optimize: bool,
    },
    /// Print a summary of an existing motion file.
    Inspect {
        /// Motion file to read.
        file: PathBuf,
    },
}
