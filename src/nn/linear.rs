use super::*;
use rand_distr::{Distribution, StandardNormal, Uniform};

/// Fully connected layer, `y = x W + b` with `W` stored as `(in, out)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    weight: Array<f32, Ix2>,
    bias: Option<Array<f32, Ix1>>,
}

impl Linear {
    pub fn new(weight: Array<f32, Ix2>, bias: Option<Array<f32, Ix1>>) -> anyhow::Result<Self> {
        if let Some(b) = bias.as_ref() {
            if b.len() != weight.ncols() {
                anyhow::bail!(
                    "bias of length {} doesn't match linear output size {}",
                    b.len(),
                    weight.ncols()
                );
            }
        }
        Ok(Self { weight, bias })
    }

    pub fn load(
        store: &ParamStore,
        in_features: usize,
        out_features: usize,
        with_bias: bool,
    ) -> anyhow::Result<Self> {
        let weight = store.get2("weight", (in_features, out_features))?;
        let bias = if with_bias {
            Some(store.get1("bias", out_features)?)
        } else {
            None
        };
        Self::new(weight, bias)
    }

    /// Weights drawn from `N(0, std)` with a zero bias.
    pub fn init_normal(
        in_features: usize,
        out_features: usize,
        std: f32,
        with_bias: bool,
        rng: &mut impl Rng,
    ) -> Self {
        let weight = Array::from_shape_simple_fn((in_features, out_features), || {
            let v: f32 = rng.sample(StandardNormal);
            v * std
        });
        let bias = with_bias.then(|| Array::zeros(out_features));
        Self { weight, bias }
    }

    /// Xavier uniform weights and a bias uniform in `±sqrt(1 / in)`.
    pub fn init_xavier(
        in_features: usize,
        out_features: usize,
        with_bias: bool,
        rng: &mut impl Rng,
    ) -> Self {
        let limit = (6.0 / (in_features + out_features) as f32).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        let weight = Array::from_shape_simple_fn((in_features, out_features), || dist.sample(rng));
        let bias = with_bias.then(|| {
            let k = (1.0 / in_features as f32).sqrt();
            let dist = Uniform::new_inclusive(-k, k);
            Array::from_shape_simple_fn(out_features, || dist.sample(rng))
        });
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (batch, time, _) = x.dim();
        let mut out = Array3::zeros((batch, time, self.out_features()));
        for (mut o, x) in out.outer_iter_mut().zip(x.outer_iter()) {
            o.assign(&x.dot(&self.weight));
        }
        if let Some(bias) = self.bias.as_ref() {
            out += bias;
        }
        out
    }

    /// Forward on a single `(batch, in)` matrix, for things like speaker embeddings.
    pub fn forward2(&self, x: &Array<f32, Ix2>) -> Array<f32, Ix2> {
        let mut out = x.dot(&self.weight);
        if let Some(bias) = self.bias.as_ref() {
            out += bias;
        }
        out
    }
}

impl Parameters for Linear {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        out.insert(join(prefix, "weight"), self.weight.clone());
        if let Some(bias) = self.bias.as_ref() {
            out.insert(join(prefix, "bias"), bias.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, arr3};

    #[test]
    fn linear_forward() {
        let weight = arr2(&[[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]]);
        let linear = Linear::new(weight, Some(arr1(&[0.0, 0.0, 1.0]))).unwrap();
        let x = arr3(&[[[1.0, 2.0]], [[3.0, -1.0]]]);
        let y = linear.forward(&x);
        assert_eq!(y, arr3(&[[[1.0, 2.0, 4.0]], [[3.0, -1.0, 3.0]]]));
    }

    #[test]
    fn reload_from_state_dict() {
        let mut rng = StdRng::seed_from_u64(0);
        let linear = Linear::init_xavier(4, 3, true, &mut rng);
        let ckpt = linear.state_dict();
        let loaded = Linear::load(&ParamStore::new(&ckpt), 4, 3, true).unwrap();
        assert_eq!(linear, loaded);
        assert!(Linear::load(&ParamStore::new(&ckpt), 3, 4, true).is_err());
    }
}
