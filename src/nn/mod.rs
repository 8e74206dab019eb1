//! The small set of layers the acoustic models are built from. Everything works on dense
//! `(batch, time, channels)` tensors, weights follow the layout of the checkpoints we load from
//! (linear weights are `(in, out)`, convolution weights `(out, in, kernel)`).
//!
//! Layers can be created two ways. `load` pulls the weights out of a [`ParamStore`] and checks the
//! shapes, `init` draws fresh weights from an RNG, which is what you want when starting a training
//! run or writing a test. Either way [`Parameters::collect_parameters`] gives the weights back as
//! a [`Checkpoint`] so they can be written to disk.
use crate::checkpoint::Checkpoint;
use anyhow::Context;
use ndarray::{Array, Array3, ArrayD, Axis, Dimension, Ix1, Ix2, Ix3};
use rand::prelude::*;

pub mod conv;
pub mod embedding;
pub mod linear;
pub mod loss;
pub mod masks;
pub mod norm;
pub mod positional;
pub mod prenet;

pub use conv::*;
pub use embedding::*;
pub use linear::*;
pub use norm::*;
pub use prenet::*;

/// Additive bias used to knock positions out of a softmax.
pub const NEG_INF: f32 = -1.0e30;

/// Whether a forward pass is part of training or inference. This is passed into every forward
/// call rather than stored on the layers so a single model can be shared between a training loop
/// and an evaluator without anyone flipping state under anyone else.
///
/// The training seed drives dropout, change it every step to get fresh masks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Train { seed: u64 },
    Eval,
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Self::Train { .. })
    }
}

/// Inverted dropout, scaling the kept activations by `1 / (1 - p)` while training and doing
/// nothing at inference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Dropout {
    p: f32,
    salt: u64,
}

impl Dropout {
    /// The name is hashed into a salt so two dropout layers with the same seed don't draw the same
    /// mask. Layers pass their parameter path so the salt matches between `init` and `load`.
    pub fn new(p: f32, name: &str) -> Self {
        Self {
            p,
            salt: fnv1a(name.as_bytes()),
        }
    }

    pub fn probability(&self) -> f32 {
        self.p
    }

    pub fn forward<D: Dimension>(&self, x: Array<f32, D>, mode: Mode) -> Array<f32, D> {
        match mode {
            Mode::Train { seed } if self.p > 0.0 => {
                if self.p >= 1.0 {
                    return x.mapv_into(|_| 0.0);
                }
                let mut rng = StdRng::seed_from_u64(seed ^ self.salt);
                let scale = 1.0 / (1.0 - self.p);
                let p = self.p;
                x.mapv_into(|v| if rng.gen::<f32>() < p { 0.0 } else { v * scale })
            }
            _ => x,
        }
    }
}

/// 64-bit FNV-1a, stable across platforms and compiler versions unlike the std hasher.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ *b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Read only view into a checkpoint rooted at a dotted prefix, in the spirit of a var builder.
#[derive(Clone, Debug)]
pub struct ParamStore<'a> {
    checkpoint: &'a Checkpoint,
    prefix: String,
}

impl<'a> ParamStore<'a> {
    pub fn new(checkpoint: &'a Checkpoint) -> Self {
        Self {
            checkpoint,
            prefix: String::new(),
        }
    }

    /// Descend into a child scope.
    pub fn pp(&self, name: impl std::fmt::Display) -> Self {
        Self {
            checkpoint: self.checkpoint,
            prefix: join(&self.prefix, &name.to_string()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checkpoint.contains(&join(&self.prefix, name))
    }

    /// Fetch a parameter and check it has the expected shape.
    pub fn get(&self, name: &str, shape: &[usize]) -> anyhow::Result<ArrayD<f32>> {
        let path = join(&self.prefix, name);
        let value = self
            .checkpoint
            .get(&path)
            .with_context(|| format!("missing parameter {}", path))?;
        if value.shape() != shape {
            anyhow::bail!(
                "parameter {} has shape {:?}, expected {:?}",
                path,
                value.shape(),
                shape
            );
        }
        Ok(value.clone())
    }

    pub fn get1(&self, name: &str, len: usize) -> anyhow::Result<Array<f32, Ix1>> {
        Ok(self.get(name, &[len])?.into_dimensionality()?)
    }

    pub fn get2(&self, name: &str, shape: (usize, usize)) -> anyhow::Result<Array<f32, Ix2>> {
        Ok(self.get(name, &[shape.0, shape.1])?.into_dimensionality()?)
    }

    pub fn get3(
        &self,
        name: &str,
        shape: (usize, usize, usize),
    ) -> anyhow::Result<Array<f32, Ix3>> {
        Ok(self
            .get(name, &[shape.0, shape.1, shape.2])?
            .into_dimensionality()?)
    }
}

/// Anything holding trainable tensors.
pub trait Parameters {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint);

    /// Convenience wrapper returning the parameters as a fresh checkpoint.
    fn state_dict(&self) -> Checkpoint {
        let mut out = Checkpoint::new();
        self.collect_parameters("", &mut out);
        out
    }
}

/// Joins two segments of a dotted parameter path.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        prefix.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

pub fn relu<D: Dimension>(x: Array<f32, D>) -> Array<f32, D> {
    x.mapv_into(|v| v.max(0.0))
}

/// Numerically stable sigmoid.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        x.exp() / (1.0 + x.exp())
    }
}

pub fn softsign(x: f32) -> f32 {
    x / (1.0 + x.abs())
}

/// Softmax over the last axis. A row where every entry carries the same mask bias comes out
/// uniform, not NaN, since the row max is subtracted first.
pub fn softmax_last(mut x: Array3<f32>) -> Array3<f32> {
    for mut lane in x.lanes_mut(Axis(2)) {
        let max = lane.fold(f32::NEG_INFINITY, |acc, v| acc.max(*v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane.mapv_inplace(|v| v / sum);
        }
    }
    x
}

/// Batched `a · b` for `(B, N, K) x (B, K, M)`.
pub fn batched_matmul(a: &Array3<f32>, b: &Array3<f32>) -> Array3<f32> {
    let (batch, n, _) = a.dim();
    let m = b.dim().2;
    let mut out = Array3::zeros((batch, n, m));
    for ((mut o, a), b) in out
        .outer_iter_mut()
        .zip(a.outer_iter())
        .zip(b.outer_iter())
    {
        o.assign(&a.dot(&b));
    }
    out
}

/// Batched `a · bᵀ` for `(B, N, K) x (B, M, K)`.
pub fn batched_matmul_transposed(a: &Array3<f32>, b: &Array3<f32>) -> Array3<f32> {
    let (batch, n, _) = a.dim();
    let m = b.dim().1;
    let mut out = Array3::zeros((batch, n, m));
    for ((mut o, a), b) in out
        .outer_iter_mut()
        .zip(a.outer_iter())
        .zip(b.outer_iter())
    {
        o.assign(&a.dot(&b.t()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr3, Array2};

    #[test]
    fn dropout_only_in_training() {
        let dropout = Dropout::new(0.5, "test");
        let x = Array2::<f32>::ones((16, 16));

        assert_eq!(dropout.forward(x.clone(), Mode::Eval), x);

        let dropped = dropout.forward(x.clone(), Mode::Train { seed: 3 });
        assert!(dropped.iter().all(|v| *v == 0.0 || (*v - 2.0).abs() < 1e-6));
        assert!(dropped.iter().any(|v| *v == 0.0));

        // Same seed, same mask
        assert_eq!(dropped, dropout.forward(x.clone(), Mode::Train { seed: 3 }));

        let other = Dropout::new(0.5, "encoder.layer_stack.1.pos_ffn");
        let first = Dropout::new(0.5, "encoder.layer_stack.0.pos_ffn");
        assert_ne!(
            first.forward(x.clone(), Mode::Train { seed: 7 }),
            other.forward(x, Mode::Train { seed: 7 })
        );
    }

    #[test]
    fn salt_is_fixed() {
        // Reference FNV-1a values, these must not change between builds
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(Dropout::new(0.1, "a"), Dropout::new(0.1, "a"));
        assert_ne!(Dropout::new(0.1, "a"), Dropout::new(0.1, "b"));
    }

    #[test]
    fn masked_softmax_rows() {
        let x = arr3(&[[[1.0, 2.0, NEG_INF], [NEG_INF, NEG_INF, NEG_INF]]]);
        let y = softmax_last(x);
        assert!((y[[0, 0, 0]] + y[[0, 0, 1]] - 1.0).abs() < 1e-6);
        assert!(y[[0, 0, 2]] < 1e-12);
        // A fully masked row degenerates to uniform
        for i in 0..3 {
            assert!((y[[0, 1, i]] - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn param_paths() {
        let mut ckpt = Checkpoint::new();
        ckpt.insert("a.b.weight", Array2::<f32>::zeros((2, 3)));
        let store = ParamStore::new(&ckpt);
        assert!(store.pp("a").pp("b").get2("weight", (2, 3)).is_ok());
        assert!(store.pp("a").pp("b").get2("weight", (3, 2)).is_err());
        assert!(store.pp("a").get2("weight", (2, 3)).is_err());
    }
}
