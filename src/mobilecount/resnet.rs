//! Residual backbone shared by both frames.
//!
//! Stages are stacks of inverted residual blocks, see "MobileNetV2: Inverted
//! Residuals and Linear Bottlenecks" Sandler et al. 2018
//! <https://arxiv.org/abs/1801.04381>
use log::debug;
use tch::nn::{self, BatchNorm, Conv2D, ModuleT};
use tch::{Device, Kind, Tensor};

use super::ops;
use crate::config::{validate_stage, ArchConfig, BlockKind, StageConfig};
use crate::error::Result;

const BASIC_BN_MOMENTUM: f64 = 0.05;
const BN_MOMENTUM: f64 = 0.1;

/// 1x1 convolution + batch-norm mapping a block input onto its output shape.
#[derive(Debug)]
pub struct Projection {
    conv: Conv2D,
    bn: BatchNorm,
}

fn downsample(p: nn::Path, c_in: i64, c_out: i64, stride: i64) -> Option<Projection> {
    if stride != 1 || c_in != c_out {
        Some(Projection {
            conv: ops::conv1x1(&p / "0", c_in, c_out, stride, false),
            bn: ops::batch_norm2d(&p / "1", c_out, BN_MOMENTUM),
        })
    } else {
        None
    }
}

impl ModuleT for Projection {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv).apply_t(&self.bn, train)
    }
}

fn residual(xs: &Tensor, ys: Tensor, shortcut: &Option<Projection>, train: bool) -> Tensor {
    match shortcut {
        Some(projection) => (xs.apply_t(projection, train) + ys).relu(),
        None => (ys + xs).relu(),
    }
}

#[derive(Debug)]
pub struct BasicBlock {
    conv1: Conv2D,
    bn1: BatchNorm,
    conv2: Conv2D,
    bn2: BatchNorm,
    downsample: Option<Projection>,
}

impl BasicBlock {
    pub fn new(p: nn::Path, c_in: i64, c_out: i64, stride: i64) -> Self {
        Self {
            conv1: ops::conv3x3(&p / "conv1", c_in, c_out, stride, false),
            bn1: ops::batch_norm2d(&p / "bn1", c_out, BASIC_BN_MOMENTUM),
            conv2: ops::conv3x3(&p / "conv2", c_out, c_out, 1, false),
            bn2: ops::batch_norm2d(&p / "bn2", c_out, BASIC_BN_MOMENTUM),
            downsample: downsample(&p / "downsample", c_in, c_out, stride),
        }
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train);
        residual(xs, ys, &self.downsample, train)
    }
}

/// Inverted bottleneck. The hidden width is `c_in * expansion`, and the 3x3
/// convolution is depthwise and carries the stride.
#[derive(Debug)]
pub struct Bottleneck {
    expand: Conv2D,
    bn1: BatchNorm,
    depthwise: Conv2D,
    bn2: BatchNorm,
    project: Conv2D,
    bn3: BatchNorm,
    downsample: Option<Projection>,
}

impl Bottleneck {
    pub fn new(p: nn::Path, c_in: i64, c_out: i64, stride: i64, expansion: i64) -> Self {
        let hidden = c_in * expansion;
        Self {
            expand: ops::conv1x1(&p / "expand", c_in, hidden, 1, false),
            bn1: ops::batch_norm2d(&p / "bn1", hidden, BN_MOMENTUM),
            depthwise: ops::depthwise3x3(&p / "depthwise", hidden, stride),
            bn2: ops::batch_norm2d(&p / "bn2", hidden, BN_MOMENTUM),
            project: ops::conv1x1(&p / "project", hidden, c_out, 1, false),
            bn3: ops::batch_norm2d(&p / "bn3", c_out, BN_MOMENTUM),
            downsample: downsample(&p / "downsample", c_in, c_out, stride),
        }
    }

    pub fn hidden_channels(&self) -> i64 {
        self.depthwise.ws.size()[0]
    }
}

impl ModuleT for Bottleneck {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs
            .apply(&self.expand)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.depthwise)
            .apply_t(&self.bn2, train)
            .relu()
            .apply(&self.project)
            .apply_t(&self.bn3, train);
        residual(xs, ys, &self.downsample, train)
    }
}

#[derive(Debug)]
pub enum ResidualBlock {
    Basic(BasicBlock),
    Bottleneck(Bottleneck),
}

impl ResidualBlock {
    pub fn new(
        p: nn::Path,
        kind: BlockKind,
        c_in: i64,
        c_out: i64,
        stride: i64,
        expansion: i64,
    ) -> Self {
        match kind {
            BlockKind::Basic => Self::Basic(BasicBlock::new(p, c_in, c_out, stride)),
            BlockKind::Bottleneck => {
                Self::Bottleneck(Bottleneck::new(p, c_in, c_out, stride, expansion))
            }
        }
    }

    /// The shortcut projection, `None` when the shortcut is the identity.
    pub fn shortcut(&self) -> Option<&Projection> {
        match self {
            Self::Basic(block) => block.downsample.as_ref(),
            Self::Bottleneck(block) => block.downsample.as_ref(),
        }
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            Self::Basic(block) => block.forward_t(xs, train),
            Self::Bottleneck(block) => block.forward_t(xs, train),
        }
    }
}

/// Shape-determining parameters of a built stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub input_channels: i64,
    pub output_channels: i64,
    pub block_count: i64,
    pub stride: i64,
    pub expansion: i64,
}

#[derive(Debug)]
pub struct Stage {
    descriptor: StageDescriptor,
    blocks: Vec<ResidualBlock>,
}

impl Stage {
    pub fn descriptor(&self) -> StageDescriptor {
        self.descriptor
    }

    pub fn blocks(&self) -> &[ResidualBlock] {
        &self.blocks
    }
}

impl ModuleT for Stage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut ys = self.blocks[0].forward_t(xs, train);
        for block in &self.blocks[1..] {
            ys = block.forward_t(&ys, train);
        }
        ys
    }
}

/// Builds one stage starting from `c_in` channels. Only the first block
/// changes stride or width. Returns the stage together with the channel
/// count the next stage starts from.
pub fn build_stage(
    p: nn::Path,
    kind: BlockKind,
    c_in: i64,
    cfg: &StageConfig,
) -> Result<(Stage, i64)> {
    validate_stage(0, cfg)?;
    let c_out = cfg.channels;
    let mut blocks = Vec::with_capacity(cfg.blocks as usize);
    blocks.push(ResidualBlock::new(
        &p / "0",
        kind,
        c_in,
        c_out,
        cfg.stride,
        cfg.expansion,
    ));
    for block_index in 1..cfg.blocks {
        blocks.push(ResidualBlock::new(
            &p / &block_index.to_string(),
            kind,
            c_out,
            c_out,
            1,
            cfg.expansion,
        ));
    }
    let descriptor = StageDescriptor {
        input_channels: c_in,
        output_channels: c_out,
        block_count: cfg.blocks,
        stride: cfg.stride,
        expansion: cfg.expansion,
    };
    Ok((Stage { descriptor, blocks }, c_out))
}

/// Stem (3x3/2 conv, batch-norm, ReLU, 3x3/2 max-pool) followed by the
/// configured stages.
#[derive(Debug)]
pub struct Backbone {
    conv1: Conv2D,
    bn1: BatchNorm,
    stages: Vec<Stage>,
}

impl Backbone {
    pub fn new(p: &nn::Path, cfg: &ArchConfig) -> Result<Self> {
        cfg.validate()?;
        let conv1 = ops::conv3x3(p / "conv1", cfg.input_channels, cfg.stem_channels, 2, false);
        let bn1 = ops::batch_norm2d(p / "bn1", cfg.stem_channels, BN_MOMENTUM);
        let mut channels = cfg.stem_channels;
        let mut stages = Vec::with_capacity(cfg.stages.len());
        for (i, stage_cfg) in cfg.stages.iter().enumerate() {
            let (stage, next) = build_stage(
                p / &format!("layer{}", i + 1),
                cfg.block,
                channels,
                stage_cfg,
            )?;
            debug!("backbone layer{}: {:?}", i + 1, stage.descriptor());
            stages.push(stage);
            channels = next;
        }
        Ok(Self { conv1, bn1, stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Dtype and device of the parameters; inputs must match them.
    pub fn options(&self) -> (Kind, Device) {
        (self.conv1.ws.kind(), self.conv1.ws.device())
    }

    /// Output of every stage, finest first.
    pub fn features_t(&self, xs: &Tensor, train: bool) -> Vec<Tensor> {
        let mut ys = ops::stem_pool(&xs.apply(&self.conv1).apply_t(&self.bn1, train).relu());
        let mut features = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            ys = ys.apply_t(stage, train);
            features.push(ys.shallow_clone());
        }
        features
    }
}
