use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tch::{nn, Device, Kind, Tensor};

use mobilecount::frames::{density_to_image, frame_pairs, FrameCache};
use mobilecount::pretrained::FileLoader;
use mobilecount::{count, ModelConfig};

#[derive(Parser)]
#[command(name = "mobilecount", about = "Crowd counting from consecutive frames")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Estimate the count for every consecutive frame pair in a directory
    Count {
        frames: PathBuf,
        /// JSON model configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Checkpoint saved from a VarStore
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Resize frames to WxH before inference
        #[arg(long, value_parser = parse_size)]
        size: Option<(u32, u32)>,
        /// Write a grayscale density map per pair into this directory
        #[arg(long)]
        save_density: Option<PathBuf>,
        #[arg(long)]
        cpu: bool,
    },
    /// Print feature shapes for a square test input and the parameter count
    Summary {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Side length of the test input
        #[arg(long, default_value_t = 256)]
        side: i64,
    },
}

fn parse_size(s: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got {s}"))?;
    let w = w.parse().map_err(|e| format!("bad width {w}: {e}"))?;
    let h = h.parse().map_err(|e| format!("bad height {h}: {e}"))?;
    Ok((w, h))
}

fn load_config(path: Option<&Path>) -> Result<ModelConfig> {
    Ok(match path {
        Some(path) => ModelConfig::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => ModelConfig::default(),
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Count {
            frames,
            config,
            weights,
            size,
            save_density,
            cpu,
        } => {
            let config = load_config(config.as_deref())?;
            let device = if cpu { Device::Cpu } else { Device::cuda_if_available() };
            let mut vs = nn::VarStore::new(device);
            let model = mobilecount::build(&vs, &config, &FileLoader::default())?;
            if let Some(weights) = weights {
                vs.load(&weights)
                    .with_context(|| format!("loading {}", weights.display()))?;
            }
            let pairs = frame_pairs(&frames)?;
            if pairs.is_empty() {
                bail!("{} holds fewer than two frames", frames.display());
            }
            if let Some(dir) = &save_density {
                std::fs::create_dir_all(dir)?;
            }
            info!("{} frame pairs on {:?}", pairs.len(), device);
            let mut cache = FrameCache::new(size, device);
            for (prev_path, curr_path) in pairs {
                let prev = cache.load(&prev_path)?;
                let curr = cache.load(&curr_path)?;
                let density = tch::no_grad(|| model.forward(&prev, &curr))?;
                println!("{}: {:.1}", curr_path.display(), count(&density)?);
                if let Some(dir) = &save_density {
                    let stem = curr_path.file_stem().unwrap_or_default().to_string_lossy();
                    density_to_image(&density.get(0))?.save(dir.join(format!("{stem}.png")))?;
                }
            }
        }
        Command::Summary { config, side } => {
            let config = load_config(config.as_deref())?;
            let stride = config.arch.output_stride();
            if side <= 0 || side % stride != 0 {
                bail!("side must be a positive multiple of {stride}");
            }
            let vs = nn::VarStore::new(Device::Cpu);
            let model = mobilecount::build(&vs, &config, &FileLoader::default())?;
            let channels = config.arch.input_channels;
            let frame = Tensor::zeros([1, channels, side, side], (Kind::Float, Device::Cpu));
            tch::no_grad(|| -> anyhow::Result<()> {
                let fused = model.fused_features_t(&frame, &frame, false)?;
                for (i, features) in fused.iter().enumerate() {
                    println!("level{}: {:?}", i + 1, features.size());
                }
                println!("output: {:?}", model.forward(&frame, &frame)?.size());
                Ok(())
            })?;
            let params: i64 = vs.trainable_variables().iter().map(|t| t.numel() as i64).sum();
            println!("trainable parameters: {params}");
        }
    }
    Ok(())
}
