//! Two-frame crowd counting with a MobileNet-style backbone and a
//! light-weight RefineNet decoder.
pub mod config;
pub mod error;
pub mod frames;
pub mod mobilecount;
pub mod pretrained;

pub use config::{ArchConfig, BlockKind, ModelConfig, OutputReduction, StageConfig, WeightSources};
pub use error::{Error, Result};
pub use mobilecount::{build, count, MobileCount};
