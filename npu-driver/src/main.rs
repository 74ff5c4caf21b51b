//! Vision NPU Driver
//!
//! Probes the NPU device context, optionally loads a golden reference
//! description, and runs a loopback self-test through the vertex ioctl
//! surface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  npu-driver                                                     │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │  NpuConfig (TOML)  ─►  NpuDevice::probe                     ││
//! │  │  golden description ─► GoldenMatcher                        ││
//! │  └─────────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │  Self-test: Vertex ─► Session ─► LoopbackEngine             ││
//! │  └─────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use npu_core::{DmaBufHeap, LoopbackEngine, NpuConfig, NpuDevice, Vertex};

mod selftest;

/// Vision NPU driver
#[derive(Parser, Debug)]
#[command(name = "npu-driver")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Golden description to load before the self-test
    #[arg(short, long)]
    golden: Option<PathBuf>,

    /// Frames pushed through the loopback engine
    #[arg(short, long, default_value_t = 4)]
    frames: u32,

    /// Feature-map edge length of the self-test graph
    #[arg(long, default_value_t = 8)]
    size: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("npu: driver v{} starting", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NpuConfig::load(path)
            .with_context(|| format!("npu: failed to load {}", path.display()))?,
        None => NpuConfig::default(),
    };
    info!("npu: configuration {:?}", config);

    let engine = LoopbackEngine::new();
    let heap = Arc::new(DmaBufHeap::new());
    let device = NpuDevice::probe(config, engine.clone(), heap.clone())
        .context("npu: failed to probe device")?;

    if let Some(path) = &args.golden {
        load_golden(&device, path)?;
    }

    let vertex = Vertex::new(device.clone());
    let report = selftest::run(
        &vertex,
        &heap,
        &selftest::SelfTestConfig {
            frames: args.frames,
            size: args.size,
        },
    )
    .context("npu: self-test failed")?;
    info!("npu: {}", report);

    let stats = engine.stats();
    info!(
        "npu: engine submitted {} completed {} power cycles {}",
        stats.submitted, stats.completed, stats.power_cycles
    );

    if device.golden().is_loaded() {
        let mut text = String::new();
        device
            .golden()
            .open_result()
            .read_to_string(&mut text)
            .context("npu: failed to read golden report")?;
        if text.is_empty() {
            warn!("npu: golden description loaded but no frame matched its filters");
        } else {
            print!("{}", text);
        }
    }

    info!("npu: ready");
    Ok(())
}

fn load_golden(device: &NpuDevice, path: &Path) -> Result<()> {
    let text = fs::read(path).with_context(|| format!("npu: failed to read {}", path.display()))?;
    let golden = device.golden();

    golden.open_desc()?;
    if let Err(e) = golden.write_desc(&text) {
        // Leave the matcher reopenable
        let _ = golden.close_desc();
        return Err(e).with_context(|| format!("npu: bad golden description {}", path.display()));
    }
    golden
        .close_desc()
        .with_context(|| format!("npu: failed to load golden files of {}", path.display()))?;
    info!("npu: golden description {} loaded", path.display());
    Ok(())
}
