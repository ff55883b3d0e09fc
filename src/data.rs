use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    prelude::*,
};
use image::{ImageReader, ImageResult, RgbImage};
use rand::thread_rng;
use rayon::{
    iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator},
    ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder,
};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use thiserror::Error;

use crate::augment::{to_chw, Transform};

const IMAGE_EXTENSIONS: [&str; 9] = [
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

pub const TRAIN_DIR: &str = "train";
pub const VALID_DIR: &str = "val";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("data root {0} does not exist")]
    MissingRoot(PathBuf),
    #[error("split directory {0} does not exist")]
    MissingSplit(PathBuf),
    #[error("no class directories found under {0}")]
    NoClasses(PathBuf),
    #[error("class directory {0} contains no images")]
    EmptyClass(PathBuf),
    #[error("class directory {0} is not one of the training classes")]
    UnknownClass(PathBuf),
    #[error("split {0} contains no images")]
    EmptySplit(PathBuf),
    #[error("model expects {expected} classes but the data has {found}")]
    ClassCount { expected: usize, found: usize },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid class map at {path}: {msg}")]
    InvalidClassMap { path: PathBuf, msg: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Bijection between class indices and class names, ordered by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMap {
    names: Vec<String>,
}

impl ClassMap {
    pub fn new(mut names: Vec<String>) -> Self {
        names.sort();
        names.dedup();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.binary_search_by(|probe| probe.as_str().cmp(name)).ok()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Writes `{"0": "<name>", ...}` so outputs can be decoded after training.
    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        let file = File::create(path).map_err(io_error(path))?;
        let mut writer = BufWriter::new(file);

        let mapping: BTreeMap<usize, &str> = self
            .names
            .iter()
            .enumerate()
            .map(|(index, name)| (index, name.as_str()))
            .collect();

        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
        mapping
            .serialize(&mut serializer)
            .map_err(|source| DatasetError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        writer.flush().map_err(io_error(path))
    }

    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let file = File::open(path).map_err(io_error(path))?;
        let mapping: BTreeMap<usize, String> = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| DatasetError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some((index, _)) = mapping.iter().enumerate().find(|(i, (key, _))| i != *key) {
            return Err(DatasetError::InvalidClassMap {
                path: path.to_path_buf(),
                msg: format!("missing index {index}"),
            });
        }

        let names: Vec<String> = mapping.into_values().collect();
        let map = Self::new(names.clone());
        if map.names != names {
            return Err(DatasetError::InvalidClassMap {
                path: path.to_path_buf(),
                msg: "class names are not unique and sorted".to_string(),
            });
        }

        Ok(map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

#[derive(Debug, Clone)]
pub struct LabeledImage {
    /// `3 x size x size` pixels in channel-major order.
    pub pixels: Vec<u8>,
    pub label: usize,
}

/// Image files on disk. Items are decoded by the batcher, not on `get`.
#[derive(Debug)]
pub struct ImageFolder {
    items: Vec<ImageItem>,
}

impl ImageFolder {
    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Dataset<ImageItem> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Decodes `item` and applies `transform`, yielding `3 x size x size` pixels.
pub fn load_image(item: &ImageItem, transform: Transform, size: u32) -> LabeledImage {
    // Headers were probed while loading, so a failure here is fatal.
    let image = decode(&item.path).unwrap_or_else(|err| {
        log::error!("failed to decode {}: {err}", item.path.display());
        panic!("failed to decode {}: {err}", item.path.display())
    });
    let image = transform.apply(&image, size, &mut thread_rng());

    LabeledImage {
        pixels: to_chw(&image),
        label: item.label,
    }
}

fn decode(path: &Path) -> ImageResult<RgbImage> {
    Ok(ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?
        .to_rgb8())
}

fn class_dirs(split_dir: &Path) -> Result<Vec<String>, DatasetError> {
    let mut names = vec![];

    for entry in fs::read_dir(split_dir).map_err(io_error(split_dir))? {
        let entry = entry.map_err(io_error(split_dir))?;
        let file_type = entry.file_type().map_err(io_error(&entry.path()))?;
        if file_type.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    names.sort();
    Ok(names)
}

fn image_files(class_dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut paths = vec![];

    for entry in fs::read_dir(class_dir).map_err(io_error(class_dir))? {
        let path = entry.map_err(io_error(class_dir))?.path();
        let is_image = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(extension))
            });

        if is_image && path.is_file() {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}

fn load_items(
    split_dir: &Path,
    classes: &ClassMap,
    dirs: &[String],
    require_images: bool,
) -> Result<Vec<ImageItem>, DatasetError> {
    let labels = dirs
        .iter()
        .map(|name| {
            classes
                .index_of(name)
                .ok_or_else(|| DatasetError::UnknownClass(split_dir.join(name)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let items: Vec<ImageItem> = dirs
        .par_iter()
        .zip(labels.par_iter())
        .map(|(name, &label)| -> Result<Vec<ImageItem>, DatasetError> {
            let class_dir = split_dir.join(name);
            let paths = image_files(&class_dir)?;
            if require_images && paths.is_empty() {
                return Err(DatasetError::EmptyClass(class_dir));
            }

            Ok(paths
                .into_iter()
                .map(|path| ImageItem { path, label })
                .collect())
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect();

    if items.is_empty() {
        return Err(DatasetError::EmptySplit(split_dir.to_path_buf()));
    }

    items.par_iter().try_for_each(|item| {
        image::image_dimensions(&item.path)
            .map(|_| ())
            .map_err(|source| DatasetError::Image {
                path: item.path.clone(),
                source,
            })
    })?;

    Ok(items)
}

/// Train and validation datasets sharing one class map.
#[derive(Debug)]
pub struct ImageFolderSplit {
    pub classes: ClassMap,
    pub train: ImageFolder,
    pub valid: ImageFolder,
}

impl ImageFolderSplit {
    /// Scans `root/train/<class>/*` and `root/val/<class>/*`. Class indices
    /// follow the sorted names of the training class directories.
    pub fn load(root: &Path) -> Result<Self, DatasetError> {
        if !root.exists() {
            return Err(DatasetError::MissingRoot(root.to_path_buf()));
        }

        let train_dir = root.join(TRAIN_DIR);
        let valid_dir = root.join(VALID_DIR);
        for dir in [&train_dir, &valid_dir] {
            if !dir.is_dir() {
                return Err(DatasetError::MissingSplit(dir.clone()));
            }
        }

        let train_classes = class_dirs(&train_dir)?;
        if train_classes.is_empty() {
            return Err(DatasetError::NoClasses(train_dir));
        }
        let classes = ClassMap::new(train_classes.clone());

        let train_items = load_items(&train_dir, &classes, &train_classes, true)?;
        let valid_items = load_items(&valid_dir, &classes, &class_dirs(&valid_dir)?, false)?;

        log::info!(
            "found {} classes, {} training images, {} validation images",
            classes.len(),
            train_items.len(),
            valid_items.len()
        );

        Ok(Self {
            classes,
            train: ImageFolder { items: train_items },
            valid: ImageFolder { items: valid_items },
        })
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    transform: Transform,
    image_size: usize,
    mean: [f32; 3],
    std: [f32; 3],
    workers: Option<Arc<ThreadPool>>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(
        device: B::Device,
        transform: Transform,
        image_size: usize,
        mean: [f32; 3],
        std: [f32; 3],
    ) -> Self {
        Self {
            device,
            transform,
            image_size,
            mean,
            std,
            workers: None,
        }
    }

    /// Decodes each batch on `workers` instead of the calling thread.
    pub fn with_workers(mut self, workers: Option<Arc<ThreadPool>>) -> Self {
        self.workers = workers;
        self
    }

    fn load(&self, items: &[ImageItem]) -> Vec<LabeledImage> {
        let size = self.image_size as u32;

        match &self.workers {
            Some(pool) => pool.install(|| {
                items
                    .par_iter()
                    .map(|item| load_image(item, self.transform, size))
                    .collect()
            }),
            None => items
                .iter()
                .map(|item| load_image(item, self.transform, size))
                .collect(),
        }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let size = self.image_size;
        let items = self.load(&items);
        let mean = Tensor::<B, 1>::from_floats(self.mean, &self.device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(self.std, &self.device).reshape([1, 3, 1, 1]);

        let images: Vec<Tensor<B, 3>> = items
            .iter()
            .map(|item| {
                TensorData::new(item.pixels.clone(), [3, size, size]).convert::<B::FloatElem>()
            })
            .map(|data| Tensor::<B, 3>::from_data(data, &self.device))
            .collect();
        let images = Tensor::stack::<4>(images, 0) / 255.;
        let images = (images - mean) / std;

        let targets = items
            .iter()
            .map(|item| (item.label as i64).elem::<B::IntElem>())
            .collect::<Vec<_>>();
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [items.len()]), &self.device);

        ImageBatch { images, targets }
    }
}

/// Decode workers: bounded by the CPU count and `max`, none for batch size 1.
pub fn worker_count(batch_size: usize, max: usize) -> usize {
    let cpus = thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    let per_batch = if batch_size > 1 { batch_size } else { 0 };

    cpus.min(per_batch).min(max)
}

/// Thread pool shared by the batchers, `None` when `workers` is zero.
pub fn worker_pool(workers: usize) -> Result<Option<Arc<ThreadPool>>, ThreadPoolBuildError> {
    if workers == 0 {
        return Ok(None);
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|index| format!("image-decode-{index}"))
        .build()?;

    Ok(Some(Arc::new(pool)))
}

/// A single ordered stream of batches: only the final batch may be short. With
/// `shuffle_seed` the whole dataset is reshuffled on every `iter()`.
pub fn build_loader<B: Backend>(
    batcher: ImageBatcher<B>,
    dataset: ImageFolder,
    batch_size: usize,
    shuffle_seed: Option<u64>,
) -> Arc<dyn DataLoader<ImageBatch<B>>> {
    let mut builder = DataLoaderBuilder::new(batcher).batch_size(batch_size);

    if let Some(seed) = shuffle_seed {
        builder = builder.shuffle(seed);
    }

    builder.build(dataset)
}
