use burn::{
    nn::{Linear, LinearConfig, Relu},
    prelude::*,
};

/// Configuration to create a [point segmentation network](PointSegNet).
#[derive(Config, Debug)]
pub struct PointSegNetConfig {
    /// Number of feature channels of every point.
    pub input_channels: usize,
    /// Number of classes predicted for every point.
    pub output_channels: usize,
    /// Size of the per-point features.
    #[config(default = 64)]
    pub hidden_size: usize,
    /// Size of the feature pooled over the whole chunk.
    #[config(default = 128)]
    pub global_size: usize,
}

/// Per-point classifier in the PointNet style.
///
/// Every point is embedded from its features and coordinates. The embeddings are max-pooled
/// over the chunk into a global descriptor, which is concatenated back to each point before
/// the classification head.
#[derive(Module, Debug)]
pub struct PointSegNet<B: Backend> {
    local_in: Linear<B>,
    local_out: Linear<B>,
    global: Linear<B>,
    head_hidden: Linear<B>,
    head_out: Linear<B>,
    activation: Relu,
}

impl PointSegNetConfig {
    /// Initializes the network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> PointSegNet<B> {
        PointSegNet {
            local_in: LinearConfig::new(self.input_channels + 3, self.hidden_size).init(device),
            local_out: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
            global: LinearConfig::new(self.hidden_size, self.global_size).init(device),
            head_hidden: LinearConfig::new(self.hidden_size + self.global_size, self.hidden_size)
                .init(device),
            head_out: LinearConfig::new(self.hidden_size, self.output_channels).init(device),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> PointSegNet<B> {
    /// Computes the class logits of every point.
    ///
    /// # Shapes
    ///
    /// - features: `[batch_size, npoints, input_channels]`
    /// - points: `[batch_size, npoints, 3]`
    /// - output: `[batch_size, npoints, output_channels]`
    pub fn forward(&self, features: Tensor<B, 3>, points: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch_size, npoints, _] = points.dims();

        let x = Tensor::cat(vec![features, points], 2);
        let x = self.activation.forward(self.local_in.forward(x));
        let local = self.activation.forward(self.local_out.forward(x));

        let global = self.activation.forward(self.global.forward(local.clone()));
        let [_, _, global_size] = global.dims();
        let global = global
            .max_dim(1)
            .expand([batch_size, npoints, global_size]);

        let x = Tensor::cat(vec![local, global], 2);
        let x = self.activation.forward(self.head_hidden.forward(x));

        self.head_out.forward(x)
    }
}
