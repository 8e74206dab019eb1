use super::*;

/// Layer normalisation over the channel axis.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerNorm {
    gamma: Array<f32, Ix1>,
    beta: Array<f32, Ix1>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(gamma: Array<f32, Ix1>, beta: Array<f32, Ix1>, eps: f32) -> anyhow::Result<Self> {
        if gamma.len() != beta.len() {
            anyhow::bail!("layer norm scale and shift differ in length");
        }
        Ok(Self { gamma, beta, eps })
    }

    pub fn load(store: &ParamStore, channels: usize) -> anyhow::Result<Self> {
        Self::new(
            store.get1("weight", channels)?,
            store.get1("bias", channels)?,
            1e-5,
        )
    }

    pub fn init(channels: usize) -> Self {
        Self {
            gamma: Array::ones(channels),
            beta: Array::zeros(channels),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, mut x: Array3<f32>) -> Array3<f32> {
        let n = x.dim().2 as f32;
        for mut lane in x.lanes_mut(Axis(2)) {
            let mean = lane.sum() / n;
            let var = lane.fold(0.0, |acc, v| acc + (v - mean).powi(2)) / n;
            let inv = 1.0 / (var + self.eps).sqrt();
            lane.mapv_inplace(|v| (v - mean) * inv);
            lane *= &self.gamma;
            lane += &self.beta;
        }
        x
    }
}

impl Parameters for LayerNorm {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        out.insert(join(prefix, "weight"), self.gamma.clone());
        out.insert(join(prefix, "bias"), self.beta.clone());
    }
}

/// Batch normalisation over the channel axis. At inference the running statistics from the
/// checkpoint are used, while training the statistics of the batch itself are.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNorm {
    gamma: Array<f32, Ix1>,
    beta: Array<f32, Ix1>,
    running_mean: Array<f32, Ix1>,
    running_var: Array<f32, Ix1>,
    eps: f32,
}

impl BatchNorm {
    pub fn load(store: &ParamStore, channels: usize) -> anyhow::Result<Self> {
        Ok(Self {
            gamma: store.get1("weight", channels)?,
            beta: store.get1("bias", channels)?,
            running_mean: store.get1("running_mean", channels)?,
            running_var: store.get1("running_var", channels)?,
            eps: 1e-5,
        })
    }

    pub fn init(channels: usize) -> Self {
        Self {
            gamma: Array::ones(channels),
            beta: Array::zeros(channels),
            running_mean: Array::zeros(channels),
            running_var: Array::ones(channels),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, mut x: Array3<f32>, mode: Mode) -> Array3<f32> {
        let (mean, var) = if mode.is_training() {
            let (b, t, c) = x.dim();
            let count = (b * t).max(1) as f32;
            let flat = x.view().into_shape((b * t, c));
            match flat {
                Ok(flat) => {
                    let mean = flat.sum_axis(Axis(0)) / count;
                    let var = flat
                        .outer_iter()
                        .fold(Array::zeros(c), |acc: Array<f32, Ix1>, row| {
                            acc + (&row - &mean).mapv(|v| v * v)
                        })
                        / count;
                    (mean, var)
                }
                // Non-contiguous input, fall back to the running statistics
                Err(_) => (self.running_mean.clone(), self.running_var.clone()),
            }
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };
        let scale = &self.gamma / &var.mapv(|v| (v + self.eps).sqrt());
        let shift = &self.beta - &(&mean * &scale);
        for mut lane in x.lanes_mut(Axis(2)) {
            lane *= &scale;
            lane += &shift;
        }
        x
    }
}

impl Parameters for BatchNorm {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        out.insert(join(prefix, "weight"), self.gamma.clone());
        out.insert(join(prefix, "bias"), self.beta.clone());
        out.insert(join(prefix, "running_mean"), self.running_mean.clone());
        out.insert(join(prefix, "running_var"), self.running_var.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr3;

    #[test]
    fn layer_norm_zero_mean_unit_var() {
        let norm = LayerNorm::init(4);
        let y = norm.forward(arr3(&[[[1.0, 2.0, 3.0, 4.0]]]));
        let mean = y.sum() / 4.0;
        let var = y.mapv(|v| (v - mean).powi(2)).sum() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn batch_norm_eval_uses_running_stats() {
        let norm = BatchNorm::init(2);
        let x = arr3(&[[[1.0, -2.0], [3.0, 4.0]]]);
        let y = norm.forward(x.clone(), Mode::Eval);
        for (a, b) in y.iter().zip(x.iter()) {
            assert!((a - b).abs() < 1e-4);
        }

        let y = norm.forward(x, Mode::Train { seed: 0 });
        // Per channel mean is removed with batch statistics
        assert!((y[[0, 0, 0]] + y[[0, 1, 0]]).abs() < 1e-4);
    }
}
