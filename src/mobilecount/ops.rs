//! Thin wrappers around the libtorch operators the network is built from.
//!
//! Every constructor applies the fixed init policy: convolution weights are
//! drawn from N(0, 0.01^2), biases start at zero, batch-norm scale at one.
use tch::nn::{self, BatchNorm, BatchNormConfig, Conv2D, ConvConfig, Init};
use tch::Tensor;

use crate::error::{Error, Result};

pub const CONV_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.01,
};

fn conv2d(
    p: nn::Path,
    c_in: i64,
    c_out: i64,
    ksize: i64,
    padding: i64,
    stride: i64,
    groups: i64,
    bias: bool,
) -> Conv2D {
    let conv2d_cfg = ConvConfig {
        stride,
        padding,
        groups,
        bias,
        ws_init: CONV_INIT,
        bs_init: Init::Const(0.0),
        ..Default::default()
    };
    nn::conv2d(p, c_in, c_out, ksize, conv2d_cfg)
}

/// 3x3 convolution with padding 1.
pub fn conv3x3(p: nn::Path, c_in: i64, c_out: i64, stride: i64, bias: bool) -> Conv2D {
    conv2d(p, c_in, c_out, 3, 1, stride, 1, bias)
}

/// 1x1 convolution. With `stride` 2 this is the shortcut downsample.
pub fn conv1x1(p: nn::Path, c_in: i64, c_out: i64, stride: i64, bias: bool) -> Conv2D {
    conv2d(p, c_in, c_out, 1, 0, stride, 1, bias)
}

/// 3x3 convolution with one group per channel.
pub fn depthwise3x3(p: nn::Path, channels: i64, stride: i64) -> Conv2D {
    conv2d(p, channels, channels, 3, 1, stride, channels, false)
}

pub fn batch_norm2d(p: nn::Path, channels: i64, momentum: f64) -> BatchNorm {
    let cfg = BatchNormConfig {
        momentum,
        ws_init: Init::Const(1.0),
        bs_init: Init::Const(0.0),
        ..Default::default()
    };
    nn::batch_norm2d(p, channels, cfg)
}

/// 3x3 stride-2 max-pool closing the stem.
pub fn stem_pool(xs: &Tensor) -> Tensor {
    xs.max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false)
}

/// 5x5 stride-1 max-pool used inside chained residual pooling; keeps H and W.
pub fn crp_pool(xs: &Tensor) -> Tensor {
    xs.max_pool2d([5, 5], [1, 1], [2, 2], [1, 1], false)
}

/// Bilinear resize of `xs` to the spatial size of `reference`.
pub fn upsample_like(xs: &Tensor, reference: &Tensor) -> Result<Tensor> {
    let size = reference.size();
    if size.len() != 4 || xs.dim() != 4 {
        return Err(Error::ShapeMismatch {
            op: "upsample",
            left: xs.size(),
            right: size,
        });
    }
    Ok(xs.upsample_bilinear2d([size[2], size[3]], false, None, None))
}

/// Concatenate along the channel axis. Every other axis must agree.
pub fn cat_channels(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (sa, sb) = (a.size(), b.size());
    let compatible = sa.len() == 4
        && sb.len() == 4
        && sa[0] == sb[0]
        && sa[2] == sb[2]
        && sa[3] == sb[3];
    if !compatible {
        return Err(Error::ShapeMismatch {
            op: "cat",
            left: sa,
            right: sb,
        });
    }
    Ok(Tensor::cat(&[a, b], 1))
}

/// Elementwise sum of two identically shaped tensors.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (sa, sb) = (a.size(), b.size());
    if sa != sb {
        return Err(Error::ShapeMismatch {
            op: "add",
            left: sa,
            right: sb,
        });
    }
    Ok(a + b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn rand(shape: [i64; 4]) -> Tensor {
        Tensor::rand(shape, (Kind::Float, Device::Cpu))
    }

    #[test]
    fn pools_keep_or_halve_size() {
        let xs = rand([1, 4, 16, 12]);
        assert_eq!(crp_pool(&xs).size(), [1, 4, 16, 12]);
        assert_eq!(stem_pool(&xs).size(), [1, 4, 8, 6]);
    }

    #[test]
    fn conv_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let xs = rand([2, 8, 10, 10]);
        let c3 = conv3x3(&root / "c3", 8, 16, 2, false);
        assert_eq!(xs.apply(&c3).size(), [2, 16, 5, 5]);
        let c1 = conv1x1(&root / "c1", 8, 4, 1, true);
        assert_eq!(xs.apply(&c1).size(), [2, 4, 10, 10]);
        let dw = depthwise3x3(&root / "dw", 8, 2);
        assert_eq!(dw.ws.size(), [8, 1, 3, 3]);
        assert_eq!(xs.apply(&dw).size(), [2, 8, 5, 5]);
    }

    #[test]
    fn batch_norm_starts_as_unit_affine() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _bn = batch_norm2d(&vs.root() / "bn", 6, 0.05);
        let vars = vs.variables();
        assert!(vars["bn.weight"].equal(&Tensor::ones([6], (Kind::Float, Device::Cpu))));
        assert!(vars["bn.bias"].equal(&Tensor::zeros([6], (Kind::Float, Device::Cpu))));
    }

    #[test]
    fn upsample_follows_reference() {
        let xs = rand([1, 3, 5, 7]);
        let reference = rand([1, 9, 10, 13]);
        assert_eq!(upsample_like(&xs, &reference).unwrap().size(), [1, 3, 10, 13]);
    }

    #[test]
    fn cat_reports_both_shapes() {
        let a = rand([1, 3, 8, 8]);
        let b = rand([1, 5, 8, 8]);
        assert_eq!(cat_channels(&a, &b).unwrap().size(), [1, 8, 8, 8]);

        let c = rand([1, 5, 4, 8]);
        match cat_channels(&a, &c) {
            Err(Error::ShapeMismatch { op, left, right }) => {
                assert_eq!(op, "cat");
                assert_eq!(left, [1, 3, 8, 8]);
                assert_eq!(right, [1, 5, 4, 8]);
            }
            other => panic!("expected a shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn add_requires_identical_shapes() {
        let a = rand([1, 4, 6, 6]);
        let b = rand([1, 4, 6, 6]);
        assert!(add(&a, &b).unwrap().allclose(&(&a + &b), 0.0, 0.0, false));
        let c = rand([1, 2, 6, 6]);
        assert!(matches!(add(&a, &c), Err(Error::ShapeMismatch { op: "add", .. })));
    }
}
