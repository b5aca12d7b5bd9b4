//! Chained residual pooling from light-weight RefineNet.
//!
//! Each stage max-pools the previous stage's pooled value, projects it with a
//! 1x1 convolution and adds it to a running sum, so the receptive field grows
//! with every stage.
use tch::nn::{self, Conv2D, ModuleT};
use tch::Tensor;

use super::ops;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct CrpBlock {
    /// Seeds the accumulator when the input width differs from the output width.
    entry: Option<Conv2D>,
    stages: Vec<Conv2D>,
}

impl CrpBlock {
    pub fn new(p: nn::Path, c_in: i64, c_out: i64, n_stages: usize) -> Result<Self> {
        if n_stages == 0 {
            return Err(Error::Configuration(
                "chained residual pooling needs at least one stage".into(),
            ));
        }
        if c_in <= 0 || c_out <= 0 {
            return Err(Error::Configuration(format!(
                "chained residual pooling widths must be positive, got {c_in} -> {c_out}"
            )));
        }
        let entry = (c_in != c_out).then(|| ops::conv1x1(&p / "entry", c_in, c_out, 1, false));
        let stages = (0..n_stages)
            .map(|i| {
                let width = if i == 0 { c_in } else { c_out };
                ops::conv1x1(&p / &i.to_string(), width, c_out, 1, false)
            })
            .collect();
        Ok(Self { entry, stages })
    }

    pub fn n_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn out_channels(&self) -> i64 {
        self.stages[0].ws.size()[0]
    }
}

impl ModuleT for CrpBlock {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let mut acc = match &self.entry {
            Some(entry) => xs.apply(entry),
            None => xs.shallow_clone(),
        };
        let mut top = xs.shallow_clone();
        for conv in &self.stages {
            top = ops::crp_pool(&top).apply(conv);
            acc = acc + &top;
        }
        acc
    }
}
