pub mod classifier;
pub mod conv_relu;
