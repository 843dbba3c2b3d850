//! Model architectures for BigEarthNet multi-label classification.
//!
//! Every classifier is: band fusion -> backbone feature extractor ->
//! linear head -> sigmoid. Backbones:
//! - Dense (flatten + fully connected layers)
//! - ResNet-18 (1x1 reducer from 12 to 3 channels, then residual stages)
//! - EfficientNet-B0 (MBConv stages with a 12-channel stem)

use bigearth_core::{ModelArchitecture, ModelConfig, FUSED_CHANNELS, FUSED_SIZE};
use bigearth_dataset::BandTensors;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{activation, backend::Backend, Tensor},
};
use tracing::info;

use crate::fusion::{fuse, FusionPlan};

/// Configuration for [`BigEarthClassifier`]
#[derive(Config, Debug)]
pub struct BigEarthClassifierConfig {
    /// Backbone architecture
    pub architecture: ModelArchitecture,
    /// Width of the multi-hot output
    pub num_classes: usize,
    /// Hidden layer widths of the dense backbone
    #[config(default = "vec![128, 64]")]
    pub dense_hidden: Vec<usize>,
    /// Dropout rate before the EfficientNet head
    #[config(default = "0.2")]
    pub dropout: f64,
}

impl BigEarthClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BigEarthClassifier<B> {
        let backbone = match self.architecture {
            ModelArchitecture::Dense => {
                Backbone::Dense(DenseBackbone::new(&self.dense_hidden, device))
            }
            ModelArchitecture::ResNet18 => Backbone::ResNet18(ResNet18Backbone::new(device)),
            ModelArchitecture::EfficientNetB0 => {
                Backbone::EfficientNetB0(EfficientNetB0Backbone::new(self.dropout, device))
            }
        };
        let head = LinearConfig::new(backbone.feature_dim(), self.num_classes)
            .with_bias(true)
            .init(device);

        BigEarthClassifier {
            backbone,
            head,
            num_classes: self.num_classes,
        }
    }
}

/// Multi-label classifier over fused Sentinel-2 bands
#[derive(Module, Debug)]
pub struct BigEarthClassifier<B: Backend> {
    backbone: Backbone<B>,
    head: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> BigEarthClassifier<B> {
    /// Per-class probabilities `[batch, num_classes]`
    pub fn forward(&self, bands: &BandTensors<B>) -> bigearth_core::Result<Tensor<B, 2>> {
        Ok(activation::sigmoid(self.forward_logits(bands)?))
    }

    /// Head output before the sigmoid
    pub fn forward_logits(&self, bands: &BandTensors<B>) -> bigearth_core::Result<Tensor<B, 2>> {
        Ok(self.logits_from_features(self.features(bands)?))
    }

    /// Backbone output, the input of the head
    pub fn features(&self, bands: &BandTensors<B>) -> bigearth_core::Result<Tensor<B, 2>> {
        let fused = fuse(bands)?;
        Ok(self.backbone.forward(fused))
    }

    /// Head logits for precomputed backbone features
    pub fn logits_from_features(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.head.forward(features)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feature_dim(&self) -> usize {
        self.backbone.feature_dim()
    }

    pub fn architecture(&self) -> ModelArchitecture {
        match self.backbone {
            Backbone::Dense(_) => ModelArchitecture::Dense,
            Backbone::ResNet18(_) => ModelArchitecture::ResNet18,
            Backbone::EfficientNetB0(_) => ModelArchitecture::EfficientNetB0,
        }
    }
}

/// Builds classifiers from registry names
#[derive(Debug, Clone, Default)]
pub struct ModelFactory {
    config: ModelConfig,
}

impl ModelFactory {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Resolves `model_name` and builds a classifier with a `num_classes` wide head.
    ///
    /// Unknown names fail with `Error::UnknownModel` unless
    /// `fallback_to_default` is set, in which case the dense model is built.
    pub fn build<B: Backend>(
        &self,
        model_name: &str,
        num_classes: usize,
        device: &B::Device,
    ) -> bigearth_core::Result<BigEarthClassifier<B>> {
        let architecture = ModelArchitecture::resolve(model_name, self.config.fallback_to_default)?;

        info!("Building {} with {} output classes", architecture, num_classes);
        FusionPlan::new().log_summary();

        let model = BigEarthClassifierConfig::new(architecture, num_classes)
            .with_dense_hidden(self.config.dense_hidden.clone())
            .with_dropout(self.config.dropout)
            .init::<B>(device);

        info!(
            "  backbone features: {}, head: {} -> {}, parameters: {}",
            model.feature_dim(),
            model.feature_dim(),
            num_classes,
            model.num_params()
        );
        Ok(model)
    }
}

/// Backbone feature extractors
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Dense(DenseBackbone<B>),
    ResNet18(ResNet18Backbone<B>),
    EfficientNetB0(EfficientNetB0Backbone<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Backbone::Dense(model) => model.forward(input),
            Backbone::ResNet18(model) => model.forward(input),
            Backbone::EfficientNetB0(model) => model.forward(input),
        }
    }

    pub fn feature_dim(&self) -> usize {
        match self {
            Backbone::Dense(model) => model.feature_dim(),
            Backbone::ResNet18(_) => ResNet18Backbone::<B>::FEATURES,
            Backbone::EfficientNetB0(_) => EfficientNetB0Backbone::<B>::FEATURES,
        }
    }
}

/// Flatten followed by stacked fully connected layers without activations
#[derive(Module, Debug)]
pub struct DenseBackbone<B: Backend> {
    layers: Vec<Linear<B>>,
    feature_dim: usize,
}

impl<B: Backend> DenseBackbone<B> {
    pub fn new(hidden: &[usize], device: &B::Device) -> Self {
        let mut in_features = FUSED_CHANNELS * FUSED_SIZE * FUSED_SIZE;
        let mut layers = Vec::with_capacity(hidden.len());
        for &width in hidden {
            layers.push(LinearConfig::new(in_features, width).init(device));
            in_features = width;
        }
        Self {
            layers,
            feature_dim: in_features,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x: Tensor<B, 2> = input.flatten(1, 3);
        for layer in &self.layers {
            x = layer.forward(x);
        }
        x
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

/// ResNet basic block: two 3x3 convolutions with an identity or projected shortcut
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Conv2d<B>>,
    downsample_bn: Option<BatchNorm<B, 2>>,
    activation: Relu,
}

impl<B: Backend> BasicBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);

        let (downsample, downsample_bn) = if stride != 1 || in_channels != out_channels {
            (
                Some(
                    Conv2dConfig::new([in_channels, out_channels], [1, 1])
                        .with_stride([stride, stride])
                        .with_bias(false)
                        .init(device),
                ),
                Some(BatchNormConfig::new(out_channels).init(device)),
            )
        } else {
            (None, None)
        };

        Self {
            conv1,
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2,
            bn2: BatchNormConfig::new(out_channels).init(device),
            downsample,
            downsample_bn,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match (&self.downsample, &self.downsample_bn) {
            (Some(conv), Some(bn)) => bn.forward(conv.forward(input.clone())),
            _ => input.clone(),
        };

        let x = self.conv1.forward(input);
        let x = self.bn1.forward(x);
        let x = self.activation.forward(x);
        let x = self.conv2.forward(x);
        let x = self.bn2.forward(x);
        self.activation.forward(x + identity)
    }
}

/// ResNet-18 feature extractor over the fused 12-band input
#[derive(Module, Debug)]
pub struct ResNet18Backbone<B: Backend> {
    // 12 -> 3 channel reducer
    reducer: Conv2d<B>,

    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    blocks: Vec<BasicBlock<B>>,
    avgpool: AdaptiveAvgPool2d,
    activation: Relu,
}

impl<B: Backend> ResNet18Backbone<B> {
    pub const FEATURES: usize = 512;

    pub fn new(device: &B::Device) -> Self {
        let reducer = Conv2dConfig::new([FUSED_CHANNELS, 3], [1, 1]).init(device);

        let conv1 = Conv2dConfig::new([3, 64], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let bn1 = BatchNormConfig::new(64).init(device);
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        // Four stages of two basic blocks each
        let stages = [(64, 64, 1), (64, 128, 2), (128, 256, 2), (256, 512, 2)];
        let mut blocks = Vec::with_capacity(8);
        for (in_channels, out_channels, stride) in stages {
            blocks.push(BasicBlock::new(in_channels, out_channels, stride, device));
            blocks.push(BasicBlock::new(out_channels, out_channels, 1, device));
        }

        Self {
            reducer,
            conv1,
            bn1,
            maxpool,
            blocks,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.reducer.forward(input);

        let x = self.conv1.forward(x);
        let x = self.bn1.forward(x);
        let x = self.activation.forward(x);
        let mut x = self.maxpool.forward(x);

        for block in &self.blocks {
            x = block.forward(x);
        }

        // Global average pooling, [batch, 512, 1, 1] -> [batch, 512]
        let x = self.avgpool.forward(x);
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }
}

/// Mobile inverted bottleneck: 1x1 expansion, depthwise conv, 1x1 projection
#[derive(Module, Debug)]
pub struct MBConv<B: Backend> {
    expand: Option<Conv2d<B>>,
    expand_bn: Option<BatchNorm<B, 2>>,
    depthwise: Conv2d<B>,
    depthwise_bn: BatchNorm<B, 2>,
    project: Conv2d<B>,
    project_bn: BatchNorm<B, 2>,
    residual: bool,
}

impl<B: Backend> MBConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expansion: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expansion;
        let (expand, expand_bn) = if expansion != 1 {
            (
                Some(
                    Conv2dConfig::new([in_channels, hidden], [1, 1])
                        .with_bias(false)
                        .init(device),
                ),
                Some(BatchNormConfig::new(hidden).init(device)),
            )
        } else {
            (None, None)
        };

        let padding = kernel / 2;
        let depthwise = Conv2dConfig::new([hidden, hidden], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(hidden)
            .with_bias(false)
            .init(device);
        let project = Conv2dConfig::new([hidden, out_channels], [1, 1])
            .with_bias(false)
            .init(device);

        Self {
            expand,
            expand_bn,
            depthwise,
            depthwise_bn: BatchNormConfig::new(hidden).init(device),
            project,
            project_bn: BatchNormConfig::new(out_channels).init(device),
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match (&self.expand, &self.expand_bn) {
            (Some(conv), Some(bn)) => activation::silu(bn.forward(conv.forward(input.clone()))),
            _ => input.clone(),
        };
        let x = activation::silu(self.depthwise_bn.forward(self.depthwise.forward(x)));
        let x = self.project_bn.forward(self.project.forward(x));

        if self.residual {
            x + input
        } else {
            x
        }
    }
}

/// EfficientNet-B0 feature extractor with a 12-channel stem
#[derive(Module, Debug)]
pub struct EfficientNetB0Backbone<B: Backend> {
    stem: Conv2d<B>,
    stem_bn: BatchNorm<B, 2>,
    blocks: Vec<MBConv<B>>,
    head_conv: Conv2d<B>,
    head_bn: BatchNorm<B, 2>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
}

impl<B: Backend> EfficientNetB0Backbone<B> {
    pub const FEATURES: usize = 1280;

    pub fn new(dropout: f64, device: &B::Device) -> Self {
        let stem = Conv2dConfig::new([FUSED_CHANNELS, 32], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);

        // (expansion, out_channels, repeats, stride, kernel)
        let stages = [
            (1, 16, 1, 1, 3),
            (6, 24, 2, 2, 3),
            (6, 40, 2, 2, 5),
            (6, 80, 3, 2, 3),
            (6, 112, 3, 1, 5),
            (6, 192, 4, 2, 5),
            (6, 320, 1, 1, 3),
        ];
        let mut blocks = Vec::new();
        let mut in_channels = 32;
        for (expansion, out_channels, repeats, stride, kernel) in stages {
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(MBConv::new(
                    in_channels,
                    out_channels,
                    expansion,
                    kernel,
                    stride,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let head_conv = Conv2dConfig::new([in_channels, Self::FEATURES], [1, 1])
            .with_bias(false)
            .init(device);

        Self {
            stem,
            stem_bn: BatchNormConfig::new(32).init(device),
            blocks,
            head_conv,
            head_bn: BatchNormConfig::new(Self::FEATURES).init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = activation::silu(self.stem_bn.forward(self.stem.forward(input)));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = activation::silu(self.head_bn.forward(self.head_conv.forward(x)));

        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        let x: Tensor<B, 2> = x.reshape([batch, channels]);
        self.dropout.forward(x)
    }
}
