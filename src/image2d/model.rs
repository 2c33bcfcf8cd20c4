use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Configuration to create a [UNet](UNet).
#[derive(Config, Debug)]
pub struct UNetConfig {
    /// Number of channels of the input images.
    #[config(default = 1)]
    pub in_channels: usize,
    /// Number of predicted classes.
    #[config(default = 2)]
    pub out_channels: usize,
    /// Number of resolution levels.
    #[config(default = 4)]
    pub n_blocks: usize,
    /// Number of filters of the first level, doubled at every level below.
    #[config(default = 32)]
    pub start_filts: usize,
}

/// Two 3x3 convolutions, each followed by batch normalization and a ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(channels: [usize; 2], device: &B::Device) -> Self {
        let conv = |ins, outs| {
            Conv2dConfig::new([ins, outs], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };

        Self {
            conv1: conv(channels[0], channels[1]),
            norm1: BatchNormConfig::new(channels[1]).init(device),
            conv2: conv(channels[1], channels[1]),
            norm2: BatchNormConfig::new(channels[1]).init(device),
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.norm1.forward(self.conv1.forward(x)));
        self.activation.forward(self.norm2.forward(self.conv2.forward(x)))
    }
}

/// Upsampling by a transposed convolution, then a [ConvBlock] over the upsampled features
/// concatenated with the skip connection.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    upconv: ConvTranspose2d<B>,
    block: ConvBlock<B>,
}

impl<B: Backend> UpBlock<B> {
    fn new(channels: [usize; 2], device: &B::Device) -> Self {
        Self {
            upconv: ConvTranspose2dConfig::new(channels, [2, 2])
                .with_stride([2, 2])
                .init(device),
            block: ConvBlock::new([2 * channels[1], channels[1]], device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.upconv.forward(x);
        self.block.forward(Tensor::cat(vec![x, skip], 1))
    }
}

/// Encoder/decoder network with skip connections predicting a class for every pixel.
///
/// The height and width of the input must be divisible by `2^(n_blocks - 1)`.
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    down: Vec<ConvBlock<B>>,
    pool: MaxPool2d,
    up: Vec<UpBlock<B>>,
    output: Conv2d<B>,
}

impl UNetConfig {
    /// Factor the spatial dimensions of the input must be a multiple of.
    pub fn size_divisor(&self) -> usize {
        1 << self.n_blocks.saturating_sub(1)
    }

    /// Initializes the network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        let filters = |level: usize| self.start_filts << level;

        let down = (0..self.n_blocks)
            .map(|level| {
                let ins = if level == 0 {
                    self.in_channels
                } else {
                    filters(level - 1)
                };
                ConvBlock::new([ins, filters(level)], device)
            })
            .collect();

        let up = (1..self.n_blocks)
            .rev()
            .map(|level| UpBlock::new([filters(level), filters(level - 1)], device))
            .collect();

        UNet {
            down,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            up,
            output: Conv2dConfig::new([self.start_filts, self.out_channels], [1, 1]).init(device),
        }
    }
}

impl<B: Backend> UNet<B> {
    /// Computes the class logits of every pixel.
    ///
    /// # Shapes
    ///
    /// - input: `[batch_size, in_channels, height, width]`
    /// - output: `[batch_size, out_channels, height, width]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.up.len());
        let mut x = input;

        for (level, block) in self.down.iter().enumerate() {
            x = block.forward(x);
            if level + 1 < self.down.len() {
                skips.push(x.clone());
                x = self.pool.forward(x);
            }
        }

        for (block, skip) in self.up.iter().zip(skips.into_iter().rev()) {
            x = block.forward(x, skip);
        }

        self.output.forward(x)
    }
}
