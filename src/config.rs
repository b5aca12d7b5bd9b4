//! Architecture constants and model configuration.
//!
//! Every field defaults to the MobileCount layout, so an empty JSON object
//! (`{}`) describes the stock network.
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Residual unit used by every backbone stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Two 3x3 convolutions, expansion ignored.
    Basic,
    /// Inverted bottleneck: 1x1 expand, depthwise 3x3, 1x1 project.
    Bottleneck,
}

/// How the classifier channels become the returned map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputReduction {
    /// Sum the rectified classifier channels into one density channel.
    ChannelSum,
    /// Return every classifier channel untouched.
    Raw,
}

/// One backbone stage: `blocks` residual units producing `channels` maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub channels: i64,
    pub blocks: i64,
    pub stride: i64,
    pub expansion: i64,
}

impl StageConfig {
    pub const fn new(channels: i64, blocks: i64, stride: i64, expansion: i64) -> Self {
        Self {
            channels,
            blocks,
            stride,
            expansion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchConfig {
    pub input_channels: i64,
    pub stem_channels: i64,
    pub block: BlockKind,
    pub stages: Vec<StageConfig>,
    /// Width of the coarsest decoder level.
    pub top_channels: i64,
    /// Width of every other decoder level.
    pub decoder_channels: i64,
    pub crp_stages: usize,
    pub dropout: f64,
    /// Number of coarsest lateral features that go through dropout.
    pub dropout_levels: usize,
    pub classifier_channels: i64,
    pub output: OutputReduction,
}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            input_channels: 3,
            stem_channels: 32,
            block: BlockKind::Bottleneck,
            stages: vec![
                StageConfig::new(32, 1, 1, 1),
                StageConfig::new(64, 2, 2, 6),
                StageConfig::new(128, 3, 2, 6),
                StageConfig::new(256, 4, 2, 6),
            ],
            top_channels: 64,
            decoder_channels: 32,
            crp_stages: 4,
            dropout: 0.5,
            dropout_levels: 2,
            classifier_channels: 10,
            output: OutputReduction::ChannelSum,
        }
    }
}

fn positive(name: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(Error::Configuration(format!(
            "{name} must be positive, got {value}"
        )));
    }
    Ok(())
}

impl ArchConfig {
    pub fn validate(&self) -> Result<()> {
        positive("input_channels", self.input_channels)?;
        positive("stem_channels", self.stem_channels)?;
        positive("top_channels", self.top_channels)?;
        positive("decoder_channels", self.decoder_channels)?;
        positive("classifier_channels", self.classifier_channels)?;
        if self.stages.is_empty() {
            return Err(Error::Configuration("at least one stage is required".into()));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            validate_stage(i, stage)?;
        }
        if self.crp_stages == 0 {
            return Err(Error::Configuration("crp_stages must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Configuration(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.dropout_levels > self.stages.len() {
            return Err(Error::Configuration(format!(
                "dropout_levels ({}) exceeds the number of stages ({})",
                self.dropout_levels,
                self.stages.len()
            )));
        }
        Ok(())
    }

    /// Total downsampling factor of the coarsest feature map.
    pub fn output_stride(&self) -> i64 {
        // stem conv and stem pool both halve
        self.stages.iter().fold(4, |acc, s| acc * s.stride)
    }
}

pub(crate) fn validate_stage(index: usize, stage: &StageConfig) -> Result<()> {
    positive(&format!("stages[{index}].channels"), stage.channels)?;
    positive(&format!("stages[{index}].blocks"), stage.blocks)?;
    positive(&format!("stages[{index}].expansion"), stage.expansion)?;
    if stage.stride != 1 && stage.stride != 2 {
        return Err(Error::Configuration(format!(
            "stages[{index}].stride must be 1 or 2, got {}",
            stage.stride
        )));
    }
    Ok(())
}

/// Architecture name to weight locator (file path, URL, ...). Resolved by a
/// [`crate::pretrained::WeightLoader`], never by the model itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightSources(BTreeMap<String, String>);

impl WeightSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, arch: impl Into<String>, locator: impl Into<String>) -> Self {
        self.0.insert(arch.into(), locator.into());
        self
    }

    pub fn locator(&self, arch: &str) -> Option<&str> {
        self.0.get(arch).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub arch: ArchConfig,
    pub num_classes: i64,
    pub pretrained: bool,
    /// Key looked up in `weights` when `pretrained` is set.
    pub arch_name: String,
    pub weights: WeightSources,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: ArchConfig::default(),
            num_classes: 1,
            pretrained: false,
            arch_name: "mobilecount".to_string(),
            weights: WeightSources::new(),
        }
    }
}

impl ModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes != 1 {
            return Err(Error::Configuration(format!(
                "num_classes must be 1 for a density map, got {}",
                self.num_classes
            )));
        }
        self.arch.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        let cfg = ArchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.output_stride(), 32);
        let widths: Vec<_> = cfg.stages.iter().map(|s| s.channels).collect();
        assert_eq!(widths, [32, 64, 128, 256]);
    }

    #[test]
    fn rejects_bad_stage() {
        let mut cfg = ArchConfig::default();
        cfg.stages[2].blocks = 0;
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        let mut cfg = ArchConfig::default();
        cfg.stages[1].stride = 3;
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        let mut cfg = ArchConfig::default();
        cfg.stages.clear();
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_bad_scalars() {
        let cfg = ArchConfig {
            dropout: 1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ArchConfig {
            crp_stages: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ModelConfig {
            num_classes: 3,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ModelConfig = serde_json::from_str(
            r#"{
                "arch": { "output": "raw", "crp_stages": 2 },
                "pretrained": true,
                "weights": { "mobilecount": "weights/mobilecount.safetensors" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.arch.output, OutputReduction::Raw);
        assert_eq!(cfg.arch.crp_stages, 2);
        assert_eq!(cfg.arch.stem_channels, 32);
        assert_eq!(cfg.num_classes, 1);
        assert_eq!(
            cfg.weights.locator("mobilecount"),
            Some("weights/mobilecount.safetensors")
        );
        assert_eq!(cfg.weights.locator("resnet50"), None);
    }

    #[test]
    fn reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, r#"{ "arch": { "block": "basic" } }"#).unwrap();
        let cfg = ModelConfig::from_file(&path).unwrap();
        assert_eq!(cfg.arch.block, BlockKind::Basic);

        std::fs::write(&path, r#"{ "arch": { "dropout": 2.0 } }"#).unwrap();
        assert!(matches!(
            ModelConfig::from_file(&path),
            Err(Error::Configuration(_))
        ));
    }
}
