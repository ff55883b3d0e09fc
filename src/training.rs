use std::{fmt, fs, path::Path};

use anyhow::Context;
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    augment::Transform,
    data::{
        build_loader, worker_count, worker_pool, DatasetError, ImageBatcher, ImageFolderSplit,
    },
    model::{ImageClassifier, VggConfig},
};

pub const CLASS_INDEX_FILE: &str = "class_indices.json";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: VggConfig,

    pub optimizer: AdamConfig,

    #[config(default = 10)]
    pub epoch_count: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-4)]
    pub learning_rate: f64,

    #[config(default = 8)]
    pub max_worker_count: usize,

    #[config(default = 224)]
    pub image_size: usize,

    #[config(default = "[0.5, 0.5, 0.5]")]
    pub mean: [f32; 3],

    #[config(default = "[0.5, 0.5, 0.5]")]
    pub std: [f32; 3],
}

/// Mutable run context threaded through the epoch loop.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub best_accuracy: f64,
    pub snapshots_written: usize,
}

impl TrainingState {
    /// Returns true when `accuracy` beats every accuracy seen so far in the run.
    pub fn observe(&mut self, accuracy: f64) -> bool {
        if accuracy > self.best_accuracy {
            self.best_accuracy = accuracy;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LossMeter {
    sum: f64,
    count: usize,
}

impl LossMeter {
    pub fn update(&mut self, loss: f64) {
        self.sum += loss;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn update(&mut self, correct: usize, total: usize) {
        debug_assert!(correct <= total);
        self.correct += correct;
        self.total += total;
    }

    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
    pub improved: bool,
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[epoch {}] train_loss: {:.3} validate_loss: {:.3} val_accuracy: {:.3}",
            self.epoch, self.train_loss, self.valid_loss, self.valid_accuracy
        )
    }
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    pub best_accuracy: f64,
    pub snapshots_written: usize,
}

fn progress_bar(len: usize) -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}]",
        )?
        .progress_chars("##-"),
    );

    Ok(bar)
}

/// Validates the data and writes the run's side files. Nothing is written when
/// validation fails.
pub fn prepare(
    data_root: &Path,
    artifact_dir: &Path,
    config: &TrainingConfig,
) -> anyhow::Result<ImageFolderSplit> {
    let split = ImageFolderSplit::load(data_root)?;

    if split.classes.len() != config.model.classes {
        return Err(DatasetError::ClassCount {
            expected: config.model.classes,
            found: split.classes.len(),
        }
        .into());
    }

    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))?;
    config
        .save(artifact_dir.join(CONFIG_FILE))
        .context("failed to save training config")?;
    split.classes.save(&artifact_dir.join(CLASS_INDEX_FILE))?;

    Ok(split)
}

pub fn train<B: AutodiffBackend>(
    data_root: &Path,
    artifact_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> anyhow::Result<TrainingReport> {
    let split = prepare(data_root, artifact_dir, &config)?;

    B::seed(config.seed);

    let model = config.model.init::<B>(&device);
    let snapshot_path =
        artifact_dir.join(format!("{}Net", config.model.architecture.name()));

    fit(&config, model, split, &snapshot_path, &device)
}

/// Runs the epoch loop, overwriting `snapshot_path` whenever validation
/// accuracy improves on the best seen so far.
pub fn fit<B, M>(
    config: &TrainingConfig,
    mut model: M,
    split: ImageFolderSplit,
    snapshot_path: &Path,
    device: &B::Device,
) -> anyhow::Result<TrainingReport>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
{
    let workers = worker_count(config.batch_size, config.max_worker_count);
    log::info!("using {workers} image decode workers");
    let pool = worker_pool(workers).context("failed to start image decode workers")?;

    let train_steps = split.train.len().div_ceil(config.batch_size);
    let valid_steps = split.valid.len().div_ceil(config.batch_size);
    println!(
        "using {} images for training, {} images for validation.",
        split.train.len(),
        split.valid.len()
    );

    let batcher_train = ImageBatcher::<B>::new(
        device.clone(),
        Transform::Train,
        config.image_size,
        config.mean,
        config.std,
    )
    .with_workers(pool.clone());
    let batcher_valid = ImageBatcher::<B::InnerBackend>::new(
        device.clone(),
        Transform::Eval,
        config.image_size,
        config.mean,
        config.std,
    )
    .with_workers(pool);

    // One batch stream per split, so the step counts below are exact.
    let dataloader_train =
        build_loader(batcher_train, split.train, config.batch_size, Some(config.seed));
    let dataloader_valid = build_loader(batcher_valid, split.valid, config.batch_size, None);

    let mut optimizer = config.optimizer.init::<B, M>();
    let mut state = TrainingState::default();
    let mut epochs = Vec::with_capacity(config.epoch_count);

    for epoch in 1..=config.epoch_count {
        state.epoch = epoch;

        let bar = progress_bar(train_steps)?;
        let mut train_loss = LossMeter::default();
        for batch in dataloader_train.iter() {
            let output = model.forward_classification(batch);
            let loss_value = output.loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optimizer.step(config.learning_rate, model, grads);

            train_loss.update(loss_value);
            bar.set_message(format!(
                "train epoch[{epoch}/{}] loss:{loss_value:.3}",
                config.epoch_count
            ));
            bar.inc(1);
        }
        bar.finish();

        // The inner module carries no autodiff graph for the whole phase.
        let model_valid = model.valid();
        let bar = progress_bar(valid_steps)?;
        let mut valid_loss = LossMeter::default();
        let mut accuracy = Accuracy::default();
        for batch in dataloader_valid.iter() {
            let output = model_valid.forward_classification(batch);
            let loss_value = output.loss.into_scalar().elem::<f64>();

            let total = output.targets.dims()[0];
            let correct = output
                .output
                .argmax(1)
                .squeeze::<1>(1)
                .equal(output.targets)
                .int()
                .sum()
                .into_scalar()
                .elem::<i64>();

            valid_loss.update(loss_value);
            accuracy.update(correct as usize, total);
            bar.set_message(format!(
                "validate epoch[{epoch}/{}] loss:{loss_value:.3}",
                config.epoch_count
            ));
            bar.inc(1);
        }
        bar.finish();

        let valid_accuracy = accuracy.value();
        let summary = EpochSummary {
            epoch,
            train_loss: train_loss.mean(),
            valid_loss: valid_loss.mean(),
            valid_accuracy,
            improved: state.observe(valid_accuracy),
        };
        println!("{summary}");

        if summary.improved {
            model
                .clone()
                .save_file(snapshot_path, &CompactRecorder::new())
                .map_err(|e| anyhow::anyhow!("failed to save snapshot: {e}"))?;
            state.snapshots_written += 1;
            log::info!(
                "epoch {}: saved snapshot to {} (val_accuracy {valid_accuracy:.3})",
                state.epoch,
                snapshot_path.display()
            );
        }

        epochs.push(summary);
    }

    println!("Finished Training");

    Ok(TrainingReport {
        epochs,
        best_accuracy: state.best_accuracy,
        snapshots_written: state.snapshots_written,
    })
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::{Autodiff, NdArray},
        nn::{Linear, LinearConfig},
    };

    use super::*;
    use crate::data::{tests::synthetic_root, ClassMap, TRAIN_DIR};

    type TestBackend = Autodiff<NdArray<f32>>;

    const SIZE: usize = 8;

    #[derive(Module, Debug)]
    struct TinyNet<B: Backend> {
        linear: Linear<B>,
    }

    impl<B: Backend> ImageClassifier<B> for TinyNet<B> {
        fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            self.linear.forward(images.flatten(1, 3))
        }
    }

    fn tiny_config() -> TrainingConfig {
        TrainingConfig::new(VggConfig::new(3), AdamConfig::new())
            .with_epoch_count(3)
            .with_batch_size(4)
            .with_image_size(SIZE)
            .with_learning_rate(1.0e-2)
    }

    #[test]
    fn snapshots_follow_strict_improvements_only() {
        let mut state = TrainingState::default();

        let improved: Vec<usize> = [0.2, 0.5, 0.4, 0.6]
            .into_iter()
            .enumerate()
            .filter(|(_, accuracy)| state.observe(*accuracy))
            .map(|(epoch, _)| epoch + 1)
            .collect();

        assert_eq!(improved, vec![1, 2, 4]);
        assert_eq!(state.best_accuracy, 0.6);
    }

    #[test]
    fn equal_accuracy_is_not_an_improvement() {
        let mut state = TrainingState::default();

        assert!(!state.observe(0.0));
        assert!(state.observe(0.5));
        assert!(!state.observe(0.5));
        assert_eq!(state.best_accuracy, 0.5);
    }

    #[test]
    fn loss_meter_reports_the_arithmetic_mean() {
        let mut meter = LossMeter::default();
        assert_eq!(meter.mean(), 0.0);

        for loss in [2.0, 1.5, 0.25, 0.25] {
            meter.update(loss);
        }

        assert!((meter.mean() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn accuracy_stays_within_unit_interval() {
        let mut accuracy = Accuracy::default();
        assert_eq!(accuracy.value(), 0.0);

        accuracy.update(3, 4);
        accuracy.update(0, 4);
        accuracy.update(2, 2);

        assert!((accuracy.value() - 0.5).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&accuracy.value()));
    }

    #[test]
    fn summary_line_matches_the_console_format() {
        let summary = EpochSummary {
            epoch: 3,
            train_loss: 1.23456,
            valid_loss: 0.5,
            valid_accuracy: 0.875,
            improved: true,
        };

        assert_eq!(
            summary.to_string(),
            "[epoch 3] train_loss: 1.235 validate_loss: 0.500 val_accuracy: 0.875"
        );
    }

    #[test]
    fn missing_data_root_halts_before_writing_anything() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = dir.path().join("artifact");

        let result = train::<TestBackend>(
            &dir.path().join("absent"),
            &artifact_dir,
            tiny_config(),
            Default::default(),
        );

        assert!(result.is_err());
        assert!(!artifact_dir.exists());
    }

    #[test]
    fn missing_split_structure_halts_before_writing_anything() {
        let root = synthetic_root(1, 1);
        fs::remove_dir_all(root.path().join(TRAIN_DIR)).unwrap();
        let artifact_dir = root.path().join("artifact");

        let result = prepare(root.path(), &artifact_dir, &tiny_config());

        assert!(result.is_err());
        assert!(!artifact_dir.exists());
    }

    #[test]
    fn class_count_mismatch_halts_before_writing_anything() {
        let root = synthetic_root(1, 1);
        let artifact_dir = root.path().join("artifact");
        let config =
            TrainingConfig::new(VggConfig::new(5), AdamConfig::new()).with_image_size(SIZE);

        let err = prepare(root.path(), &artifact_dir, &config).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::ClassCount {
                expected: 5,
                found: 3
            })
        ));
        assert!(!artifact_dir.exists());
    }

    #[test]
    fn prepare_writes_class_map_and_config() {
        let root = synthetic_root(1, 1);
        let artifact_dir = root.path().join("artifact");

        let split = prepare(root.path(), &artifact_dir, &tiny_config()).unwrap();

        let written = ClassMap::load(&artifact_dir.join(CLASS_INDEX_FILE)).unwrap();
        assert_eq!(written, split.classes);

        let config = TrainingConfig::load(artifact_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(config.image_size, SIZE);
        assert_eq!(config.model.classes, 3);
    }

    #[test]
    fn fit_records_every_epoch_and_saves_only_on_improvement() {
        let root = synthetic_root(4, 2);
        let artifact_dir = root.path().join("artifact");
        let config = tiny_config();
        let device = Default::default();

        let split = prepare(root.path(), &artifact_dir, &config).unwrap();
        let model = TinyNet::<TestBackend> {
            linear: LinearConfig::new(3 * SIZE * SIZE, 3).init(&device),
        };
        let snapshot = artifact_dir.join("tinyNet");

        let report = fit(&config, model, split, &snapshot, &device).unwrap();

        assert_eq!(report.epochs.len(), 3);
        for (index, summary) in report.epochs.iter().enumerate() {
            assert_eq!(summary.epoch, index + 1);
            assert!((0.0..=1.0).contains(&summary.valid_accuracy));
            assert!(summary.train_loss.is_finite());
            assert!(summary.valid_loss.is_finite());
        }

        let best = report
            .epochs
            .iter()
            .map(|summary| summary.valid_accuracy)
            .fold(0.0, f64::max);
        let improvements = report.epochs.iter().filter(|s| s.improved).count();

        assert_eq!(report.best_accuracy, best);
        assert_eq!(report.snapshots_written, improvements);
        assert_eq!(
            snapshot.with_extension("mpk").exists(),
            report.snapshots_written > 0
        );
    }
}
