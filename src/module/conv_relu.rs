use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

/// 3x3 same-padding convolution followed by ReLU.
#[derive(Module, Debug)]
pub struct ConvRelu<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> ConvRelu<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.conv.forward(x))
    }
}

#[derive(Config, Debug)]
pub struct ConvReluConfig {
    channels: [usize; 2],

    #[config(default = "[3, 3]")]
    kernel_size: [usize; 2],

    #[config(default = "PaddingConfig2d::Explicit(1, 1)")]
    padding: PaddingConfig2d,
}

impl ConvReluConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvRelu<B> {
        ConvRelu {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_padding(self.padding.clone())
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(device),
        }
    }
}
