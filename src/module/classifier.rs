use burn::{
    nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig},
    prelude::*,
    tensor::activation::relu,
};

/// Fully-connected head: two hidden layers with dropout, then the class scores.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    dropout: Dropout,
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(x);
        let x = relu(self.fc1.forward(x));
        let x = self.dropout.forward(x);
        let x = relu(self.fc2.forward(x));

        self.fc3.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    input_size: usize,
    hidden_size: usize,
    classes: usize,

    #[config(default = 0.5)]
    dropout: f64,
}

impl ClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let linear = |input: usize, output: usize| {
            LinearConfig::new(input, output)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init::<B>(device)
        };

        Classifier {
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: linear(self.input_size, self.hidden_size),
            fc2: linear(self.hidden_size, self.hidden_size),
            fc3: linear(self.hidden_size, self.classes),
        }
    }
}
