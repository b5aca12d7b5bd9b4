//! MobileCount: crowd density estimation from two consecutive frames.
//!
//! Both frames run through one shared [`Backbone`]. The per-stage features of
//! the two frames are concatenated and refined top-down by a light-weight
//! RefineNet decoder, see "Light-Weight RefineNet for Real-Time Semantic
//! Segmentation" Nekrasov et al. 2018 <https://arxiv.org/abs/1810.03272>
use log::{debug, info, warn};
use tch::nn::{self, Conv2D};
use tch::{Kind, Tensor};

use crate::config::{ArchConfig, ModelConfig, OutputReduction};
use crate::error::{Error, Result};
use crate::pretrained::{self, LoadReport, WeightLoader};

mod crp;
pub mod ops;
mod resnet;

pub use crp::CrpBlock;
pub use resnet::{
    build_stage, Backbone, BasicBlock, Bottleneck, Projection, ResidualBlock, Stage,
    StageDescriptor,
};

/// One decoder level: lateral reduction, optional fusion with the coarser
/// estimate, chained residual pooling and an optional output projection.
#[derive(Debug)]
pub struct RefineLevel {
    dropout: Option<f64>,
    reduce: Conv2D,
    adapt: Option<Conv2D>,
    crp: CrpBlock,
    project: Option<Conv2D>,
}

impl RefineLevel {
    pub fn forward_t(
        &self,
        lateral: &Tensor,
        coarser: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut xs = match self.dropout {
            Some(p) => lateral.dropout(p, train),
            None => lateral.shallow_clone(),
        };
        xs = xs.apply(&self.reduce);
        if let Some(adapt) = &self.adapt {
            xs = xs.apply(adapt);
        }
        if let Some(coarser) = coarser {
            xs = ops::add(&xs, coarser)?;
        }
        let xs = xs.relu().apply_t(&self.crp, train);
        Ok(match &self.project {
            Some(project) => xs.apply(project),
            None => xs,
        })
    }

    pub fn crp(&self) -> &CrpBlock {
        &self.crp
    }

    /// Dropout rate applied to the lateral feature, if any.
    pub fn dropout(&self) -> Option<f64> {
        self.dropout
    }
}

#[derive(Debug)]
pub struct MobileCount {
    input_channels: i64,
    backbone: Backbone,
    /// Coarsest level first.
    levels: Vec<RefineLevel>,
    dropout: f64,
    classifier: Conv2D,
    output: OutputReduction,
}

impl MobileCount {
    pub fn new(p: &nn::Path, cfg: &ArchConfig) -> Result<Self> {
        cfg.validate()?;
        let backbone = Backbone::new(&(p / "backbone"), cfg)?;
        let decoder = p / "decoder";
        let n = cfg.stages.len();
        let mut levels = Vec::with_capacity(n);
        let mut width = cfg.top_channels;
        for (depth, idx) in (0..n).rev().enumerate() {
            let lateral = 2 * cfg.stages[idx].channels;
            let top = depth == 0;
            let finest = idx == 0;
            let level_p = &decoder / &format!("level{}", idx + 1);
            let c_mid = if top { cfg.top_channels } else { cfg.decoder_channels };
            let level = RefineLevel {
                dropout: (depth < cfg.dropout_levels).then_some(cfg.dropout),
                reduce: ops::conv1x1(&level_p / "reduce", lateral, c_mid, 1, false),
                adapt: (!top).then(|| ops::conv1x1(&level_p / "adapt", c_mid, c_mid, 1, false)),
                crp: CrpBlock::new(&level_p / "crp", c_mid, c_mid, cfg.crp_stages)?,
                project: (!finest).then(|| {
                    ops::conv1x1(&level_p / "project", c_mid, cfg.decoder_channels, 1, false)
                }),
            };
            debug!("decoder level{}: {} -> {}", idx + 1, lateral, c_mid);
            levels.push(level);
            width = c_mid;
        }
        let classifier = ops::conv3x3(p / "classifier", width, cfg.classifier_channels, 1, true);
        Ok(Self {
            input_channels: cfg.input_channels,
            backbone,
            levels,
            dropout: cfg.dropout,
            classifier,
            output: cfg.output,
        })
    }

    pub fn backbone(&self) -> &Backbone {
        &self.backbone
    }

    pub fn levels(&self) -> &[RefineLevel] {
        &self.levels
    }

    /// Dropout rate in front of the classifier.
    pub fn classifier_dropout(&self) -> f64 {
        self.dropout
    }

    fn check_frames(&self, prev: &Tensor, curr: &Tensor) -> Result<()> {
        let (sp, sc) = (prev.size(), curr.size());
        if sp != sc || sp.len() != 4 || sp[1] != self.input_channels {
            return Err(Error::ShapeMismatch {
                op: "frames",
                left: sp,
                right: sc,
            });
        }
        let expected = self.backbone.options();
        for frame in [prev, curr] {
            let actual = (frame.kind(), frame.device());
            if actual != expected {
                return Err(Error::Options {
                    op: "frames",
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Channel-wise concatenation `[prev, curr]` of each stage's features,
    /// finest first. The backbone runs once per frame with the same weights.
    pub fn fused_features_t(
        &self,
        prev: &Tensor,
        curr: &Tensor,
        train: bool,
    ) -> Result<Vec<Tensor>> {
        self.check_frames(prev, curr)?;
        let prev_features = self.backbone.features_t(prev, train);
        let curr_features = self.backbone.features_t(curr, train);
        prev_features
            .iter()
            .zip(curr_features.iter())
            .map(|(p, c)| ops::cat_channels(p, c))
            .collect()
    }

    /// Density map for the frame pair, same spatial size as the frames.
    pub fn forward_t(&self, prev: &Tensor, curr: &Tensor, train: bool) -> Result<Tensor> {
        let fused = self.fused_features_t(prev, curr, train)?;
        let mut refined: Option<Tensor> = None;
        for (level, idx) in self.levels.iter().zip((0..fused.len()).rev()) {
            let xs = level.forward_t(&fused[idx], refined.as_ref(), train)?;
            refined = Some(if idx > 0 {
                ops::upsample_like(&xs, &fused[idx - 1])?
            } else {
                xs
            });
        }
        let xs = refined.ok_or_else(|| Error::Configuration("decoder has no levels".into()))?;
        let out = xs.dropout(self.dropout, train).apply(&self.classifier);
        let out = ops::upsample_like(&out, curr)?.relu();
        Ok(match self.output {
            OutputReduction::ChannelSum => out.sum_dim_intlist(&[1i64][..], true, out.kind()),
            OutputReduction::Raw => out,
        })
    }

    /// Evaluation-mode forward pass.
    pub fn forward(&self, prev: &Tensor, curr: &Tensor) -> Result<Tensor> {
        self.forward_t(prev, curr, false)
    }
}

/// Estimated head count: the integral of a density map.
pub fn count(density: &Tensor) -> Result<f64> {
    Ok(f64::try_from(density.sum(Kind::Double))?)
}

/// Builds the model under `vs.root()` and, when requested, overwrites the
/// fresh parameters with the weights `loader` fetches for `config.arch_name`.
/// Weight loading failures leave the random initialization in place.
pub fn build(
    vs: &nn::VarStore,
    config: &ModelConfig,
    loader: &dyn WeightLoader,
) -> Result<MobileCount> {
    config.validate()?;
    let model = MobileCount::new(&vs.root(), &config.arch)?;
    if config.pretrained {
        match pretrained::apply(vs, &config.arch_name, &config.weights, loader) {
            LoadReport::Loaded(stats) => {
                info!("pretrained weights for {}: {stats}", config.arch_name)
            }
            LoadReport::Unavailable(reason) => {
                warn!("pretrained weights for {} unavailable: {reason}", config.arch_name)
            }
        }
    }
    Ok(model)
}
