use burn::{
    nn::{
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    train::ClassificationOutput,
};
use serde::{Deserialize, Serialize};

use crate::{
    data::ImageBatch,
    module::{
        classifier::{Classifier, ClassifierConfig},
        conv_relu::{ConvRelu, ConvReluConfig},
    },
};

const POOLED_SIZE: usize = 7;
const FEATURE_CHANNELS: usize = 512;

#[derive(Clone, Copy)]
enum Stage {
    Conv(usize),
    Pool,
}

use Stage::{Conv, Pool};

// Configurations A, B, D and E from "Very Deep Convolutional Networks for
// Large-Scale Image Recognition".
#[rustfmt::skip]
const VGG11: &[Stage] = &[
    Conv(64), Pool,
    Conv(128), Pool,
    Conv(256), Conv(256), Pool,
    Conv(512), Conv(512), Pool,
    Conv(512), Conv(512), Pool,
];
#[rustfmt::skip]
const VGG13: &[Stage] = &[
    Conv(64), Conv(64), Pool,
    Conv(128), Conv(128), Pool,
    Conv(256), Conv(256), Pool,
    Conv(512), Conv(512), Pool,
    Conv(512), Conv(512), Pool,
];
#[rustfmt::skip]
const VGG16: &[Stage] = &[
    Conv(64), Conv(64), Pool,
    Conv(128), Conv(128), Pool,
    Conv(256), Conv(256), Conv(256), Pool,
    Conv(512), Conv(512), Conv(512), Pool,
    Conv(512), Conv(512), Conv(512), Pool,
];
#[rustfmt::skip]
const VGG19: &[Stage] = &[
    Conv(64), Conv(64), Pool,
    Conv(128), Conv(128), Pool,
    Conv(256), Conv(256), Conv(256), Conv(256), Pool,
    Conv(512), Conv(512), Conv(512), Conv(512), Pool,
    Conv(512), Conv(512), Conv(512), Conv(512), Pool,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Vgg11,
    Vgg13,
    Vgg16,
    Vgg19,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Vgg11 => "vgg11",
            Architecture::Vgg13 => "vgg13",
            Architecture::Vgg16 => "vgg16",
            Architecture::Vgg19 => "vgg19",
        }
    }

    fn stages(&self) -> &'static [Stage] {
        match self {
            Architecture::Vgg11 => VGG11,
            Architecture::Vgg13 => VGG13,
            Architecture::Vgg16 => VGG16,
            Architecture::Vgg19 => VGG19,
        }
    }
}

/// Anything that maps a batch of images to per-class scores.
pub trait ImageClassifier<B: Backend> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn forward_classification(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        let output = self.forward(batch.images);

        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), batch.targets.clone());

        ClassificationOutput::new(loss, output, batch.targets)
    }
}

#[derive(Module, Debug)]
enum FeatureLayer<B: Backend> {
    Conv(ConvRelu<B>),
    Pool(MaxPool2d),
}

impl<B: Backend> FeatureLayer<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            FeatureLayer::Conv(conv) => conv.forward(x),
            FeatureLayer::Pool(pool) => pool.forward(x),
        }
    }
}

#[derive(Module, Debug)]
pub struct Vgg<B: Backend> {
    features: Vec<FeatureLayer<B>>,

    avg_pool: AdaptiveAvgPool2d,
    classifier: Classifier<B>,
}

impl<B: Backend> ImageClassifier<B> for Vgg<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .features
            .iter()
            .fold(images, |x, layer| layer.forward(x));

        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);
        self.classifier.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct VggConfig {
    pub classes: usize,

    #[config(default = "Architecture::Vgg16")]
    pub architecture: Architecture,

    #[config(default = 0.5)]
    pub dropout: f64,

    #[config(default = 4096)]
    pub hidden_size: usize,
}

impl VggConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg<B> {
        let mut input_channel = 3;
        let mut features = vec![];

        for stage in self.architecture.stages() {
            match *stage {
                Conv(channels) => {
                    features.push(FeatureLayer::Conv(
                        ConvReluConfig::new([input_channel, channels]).init(device),
                    ));
                    input_channel = channels;
                }
                Pool => {
                    features.push(FeatureLayer::Pool(
                        MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                    ));
                }
            }
        }

        Vgg {
            features,
            avg_pool: AdaptiveAvgPool2dConfig::new([POOLED_SIZE, POOLED_SIZE]).init(),
            classifier: ClassifierConfig::new(
                FEATURE_CHANNELS * POOLED_SIZE * POOLED_SIZE,
                self.hidden_size,
                self.classes,
            )
            .with_dropout(self.dropout)
            .init(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    fn conv_count<B: Backend>(model: &Vgg<B>) -> usize {
        model
            .features
            .iter()
            .filter(|layer| matches!(layer, FeatureLayer::Conv(_)))
            .count()
    }

    #[test]
    fn vgg16_has_thirteen_convolutions_and_three_linear_layers() {
        let device = Default::default();
        let model = VggConfig::new(5)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);

        assert_eq!(conv_count(&model), 13);
        assert_eq!(model.features.len(), 18);

        // 14_714_688 convolution parameters plus the three linear layers.
        let linear = (512 * 7 * 7 * 8 + 8) + (8 * 8 + 8) + (8 * 5 + 5);
        assert_eq!(model.num_params(), 14_714_688 + linear);
    }

    #[test]
    fn variants_differ_only_in_convolution_depth() {
        let device = Default::default();
        let counts: Vec<usize> = [
            Architecture::Vgg11,
            Architecture::Vgg13,
            Architecture::Vgg16,
            Architecture::Vgg19,
        ]
        .into_iter()
        .map(|architecture| {
            let model = VggConfig::new(2)
                .with_architecture(architecture)
                .with_hidden_size(4)
                .init::<TestBackend>(&device);
            conv_count(&model)
        })
        .collect();

        assert_eq!(counts, vec![8, 10, 13, 16]);
    }

    #[test]
    fn forward_yields_one_score_per_class() {
        let device = Default::default();
        let model = VggConfig::new(5)
            .with_architecture(Architecture::Vgg11)
            .with_hidden_size(8)
            .init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let scores = model.forward(images);

        assert_eq!(scores.dims(), [2, 5]);
    }

    #[test]
    fn architecture_names_match_snapshot_prefixes() {
        assert_eq!(Architecture::Vgg16.name(), "vgg16");
        assert_eq!(
            serde_json::to_string(&Architecture::Vgg19).unwrap(),
            "\"vgg19\""
        );
    }
}
