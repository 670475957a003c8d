//! CNN Model Architecture for Rice Disease Classification
//!
//! This is the architecture the trained checkpoint was produced with. It is
//! only ever instantiated here to receive checkpoint weights and to be walked
//! by the interchange exporter.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::config::ExportConfig;

/// Kernel size of every convolution
pub const KERNEL_SIZE: usize = 3;

/// Epsilon of every batch-norm layer
pub const BATCH_NORM_EPSILON: f64 = 1e-5;

/// Configuration for the RiceDiseaseCnn model
#[derive(Config, Debug)]
pub struct RiceDiseaseCnnConfig {
    /// Number of output classes
    #[config(default = "4")]
    pub num_classes: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Number of conv blocks
    #[config(default = "4")]
    pub num_blocks: usize,

    /// Filters of the first block, doubled in every following block
    #[config(default = "32")]
    pub base_filters: usize,

    /// Width of the hidden fully connected layer
    #[config(default = "256")]
    pub hidden_units: usize,

    /// Dropout rate (inert outside training)
    #[config(default = "0.3")]
    pub dropout_rate: f64,
}

impl RiceDiseaseCnnConfig {
    /// Build the model configuration declared by an export configuration
    pub fn from_export(config: &ExportConfig) -> Self {
        Self::new()
            .with_num_classes(config.num_classes())
            .with_in_channels(config.input.channels)
            .with_num_blocks(config.architecture.num_blocks)
            .with_base_filters(config.architecture.base_filters)
            .with_hidden_units(config.architecture.hidden_units)
            .with_dropout_rate(config.architecture.dropout)
    }

    /// Output channels of block `index`
    pub fn block_filters(&self, index: usize) -> usize {
        self.base_filters << index
    }

    /// Channel count entering the classifier head
    pub fn feature_channels(&self) -> usize {
        self.block_filters(self.num_blocks - 1)
    }

    /// Parameter shapes a checkpoint of this architecture must contain, in
    /// the same order as [`RiceDiseaseCnn::param_shapes`]
    pub fn expected_param_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();
        let mut in_channels = self.in_channels;

        for index in 0..self.num_blocks {
            let out = self.block_filters(index);
            let prefix = format!("blocks.{}", index);
            shapes.push((
                format!("{}.conv.weight", prefix),
                vec![out, in_channels, KERNEL_SIZE, KERNEL_SIZE],
            ));
            shapes.push((format!("{}.conv.bias", prefix), vec![out]));
            for stat in ["gamma", "beta", "running_mean", "running_var"] {
                shapes.push((format!("{}.bn.{}", prefix, stat), vec![out]));
            }
            in_channels = out;
        }

        shapes.push(("fc1.weight".to_string(), vec![in_channels, self.hidden_units]));
        shapes.push(("fc1.bias".to_string(), vec![self.hidden_units]));
        shapes.push(("fc2.weight".to_string(), vec![self.hidden_units, self.num_classes]));
        shapes.push(("fc2.bias".to_string(), vec![self.num_classes]));
        shapes
    }
}

/// A CNN block with Conv2d, BatchNorm, ReLU, and MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    /// Create a new convolutional block
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [KERNEL_SIZE, KERNEL_SIZE])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let bn = BatchNormConfig::new(out_channels)
            .with_epsilon(BATCH_NORM_EPSILON)
            .init(device);

        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        Self {
            conv,
            bn,
            relu: Relu::new(),
            pool,
        }
    }

    /// Forward pass through the block
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Rice Disease Classifier CNN
///
/// Architecture:
/// - N convolutional blocks with doubling filter counts
/// - BatchNorm and ReLU after each convolution, MaxPooling after each block
/// - Global Average Pooling
/// - Fully connected classifier with dropout
#[derive(Module, Debug)]
pub struct RiceDiseaseCnn<B: Backend> {
    // Public for weight export
    pub blocks: Vec<ConvBlock<B>>,

    pub global_pool: AdaptiveAvgPool2d,

    pub fc1: Linear<B>,
    pub dropout: Dropout,
    pub fc2: Linear<B>,

    num_classes: usize,
}

impl<B: Backend> RiceDiseaseCnn<B> {
    /// Create a new model from configuration with freshly initialised weights
    pub fn new(config: &RiceDiseaseCnnConfig, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(config.num_blocks);
        let mut in_channels = config.in_channels;
        for index in 0..config.num_blocks {
            let out = config.block_filters(index);
            blocks.push(ConvBlock::new(in_channels, out, device));
            in_channels = out;
        }

        let global_pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();

        let fc1 = LinearConfig::new(config.feature_channels(), config.hidden_units).init(device);
        let dropout = DropoutConfig::new(config.dropout_rate).init();
        let fc2 = LinearConfig::new(config.hidden_units, config.num_classes).init(device);

        Self {
            blocks,
            global_pool,
            fc1,
            dropout,
            fc2,
            num_classes: config.num_classes,
        }
    }

    /// Forward pass through the network
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, channels, height, width]
    ///
    /// # Returns
    /// * Logits tensor of shape [batch_size, num_classes]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }

        // Global pooling: [B, C, H, W] -> [B, C, 1, 1]
        let x = self.global_pool.forward(x);

        // Flatten: [B, C, 1, 1] -> [B, C]
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.fc1.forward(x);
        let x = Relu::new().forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// Forward pass with softmax for inference
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let logits = self.forward(x);
        burn::tensor::activation::softmax(logits, 1)
    }

    /// Get the number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Actual parameter shapes, named like [`RiceDiseaseCnnConfig::expected_param_shapes`]
    pub fn param_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();

        for (index, block) in self.blocks.iter().enumerate() {
            let prefix = format!("blocks.{}", index);
            shapes.push((
                format!("{}.conv.weight", prefix),
                block.conv.weight.val().dims().to_vec(),
            ));
            // A missing bias shows up as an empty shape and fails the comparison
            let bias = block
                .conv
                .bias
                .as_ref()
                .map(|b| b.val().dims().to_vec())
                .unwrap_or_default();
            shapes.push((format!("{}.conv.bias", prefix), bias));
            shapes.push((format!("{}.bn.gamma", prefix), block.bn.gamma.val().dims().to_vec()));
            shapes.push((format!("{}.bn.beta", prefix), block.bn.beta.val().dims().to_vec()));
            shapes.push((
                format!("{}.bn.running_mean", prefix),
                block.bn.running_mean.value().dims().to_vec(),
            ));
            shapes.push((
                format!("{}.bn.running_var", prefix),
                block.bn.running_var.value().dims().to_vec(),
            ));
        }

        for (name, linear) in [("fc1", &self.fc1), ("fc2", &self.fc2)] {
            shapes.push((format!("{}.weight", name), linear.weight.val().dims().to_vec()));
            let bias = linear
                .bias
                .as_ref()
                .map(|b| b.val().dims().to_vec())
                .unwrap_or_default();
            shapes.push((format!("{}.bias", name), bias));
        }

        shapes
    }
}
