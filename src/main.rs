use std::path::Path;

use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    optim::AdamConfig,
};
use env_logger::Env;
use model::{Architecture, VggConfig};
use training::{train, TrainingConfig};

pub mod augment;
pub mod data;
pub mod model;
pub mod module;
pub mod training;

const DATA_ROOT: &str = "data_set/flower_data";
const ARTIFACT_DIR: &str = "artifact";

// daisy, dandelion, roses, sunflowers, tulips
const CLASS_COUNT: usize = 5;
const ARCHITECTURE: Architecture = Architecture::Vgg16;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    // Picks a discrete or integrated GPU when one exists, else the CPU adapter.
    let device = WgpuDevice::BestAvailable;
    println!("using {device:?} device");

    let report = train::<AutodiffBackend>(
        Path::new(DATA_ROOT),
        Path::new(ARTIFACT_DIR),
        TrainingConfig::new(
            VggConfig::new(CLASS_COUNT).with_architecture(ARCHITECTURE),
            AdamConfig::new(),
        )
        .with_epoch_count(10),
        device,
    )?;

    log::info!(
        "best val_accuracy {:.3} over {} epochs, {} snapshots written",
        report.best_accuracy,
        report.epochs.len(),
        report.snapshots_written
    );

    Ok(())
}
