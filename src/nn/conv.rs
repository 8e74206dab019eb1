//! 1D convolutions over `(batch, time, channels)` tensors.
//!
//! The implementations are the straightforward "one matrix multiply per kernel tap" formulation:
//! for every tap `k` the input is shifted by `k * dilation` frames and multiplied by the
//! `(in, out)` slice of the weight for that tap. This isn't the fastest way to do it but it keeps
//! the code small and is plenty fast for inference on a sentence at a time.
use super::*;
use ndarray::{s, Array2};
use rand_distr::StandardNormal;

/// Activation applied after a plain convolution block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Activation {
    Identity,
    Relu,
    Sigmoid,
    Tanh,
}

impl Activation {
    pub fn apply(&self, x: Array3<f32>) -> Array3<f32> {
        match self {
            Self::Identity => x,
            Self::Relu => relu(x),
            Self::Sigmoid => x.mapv_into(sigmoid),
            Self::Tanh => x.mapv_into(f32::tanh),
        }
    }
}

fn normal_weight(shape: (usize, usize, usize), std: f32, rng: &mut impl Rng) -> Array3<f32> {
    Array3::from_shape_simple_fn(shape, || {
        let v: f32 = rng.sample(StandardNormal);
        v * std
    })
}

/// Standard 1D convolution with stride 1. Weight layout is `(out, in, kernel)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Conv1d {
    weight: Array3<f32>,
    bias: Option<Array<f32, Ix1>>,
    padding: usize,
    dilation: usize,
}

impl Conv1d {
    pub fn new(
        weight: Array3<f32>,
        bias: Option<Array<f32, Ix1>>,
        padding: usize,
        dilation: usize,
    ) -> anyhow::Result<Self> {
        if dilation == 0 {
            anyhow::bail!("convolution dilation must be at least 1");
        }
        if let Some(b) = bias.as_ref() {
            if b.len() != weight.dim().0 {
                anyhow::bail!(
                    "bias of length {} doesn't match {} output channels",
                    b.len(),
                    weight.dim().0
                );
            }
        }
        Ok(Self {
            weight,
            bias,
            padding,
            dilation,
        })
    }

    pub fn load(
        store: &ParamStore,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        dilation: usize,
    ) -> anyhow::Result<Self> {
        let weight = store.get3("weight", (out_channels, in_channels, kernel_size))?;
        let bias = Some(store.get1("bias", out_channels)?);
        Self::new(weight, bias, padding, dilation)
    }

    pub fn init(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        dilation: usize,
        std: f32,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            weight: normal_weight((out_channels, in_channels, kernel_size), std, rng),
            bias: Some(Array::zeros(out_channels)),
            padding,
            dilation: dilation.max(1),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.dim().2
    }

    /// Number of output frames for an input of `time` frames.
    pub fn output_len(&self, time: usize) -> usize {
        let span = self.dilation * (self.kernel_size() - 1);
        (time + 2 * self.padding).saturating_sub(span)
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (batch, time, channels) = x.dim();
        let out_time = self.output_len(time);
        let mut out = Array3::zeros((batch, out_time, self.out_channels()));

        let taps = (0..self.kernel_size())
            .map(|k| self.weight.slice(s![.., .., k]).t().to_owned())
            .collect::<Vec<Array2<f32>>>();

        for (mut o, x) in out.outer_iter_mut().zip(x.outer_iter()) {
            let mut padded = Array2::zeros((time + 2 * self.padding, channels));
            padded
                .slice_mut(s![self.padding..self.padding + time, ..])
                .assign(&x);
            for (k, tap) in taps.iter().enumerate() {
                let start = k * self.dilation;
                let window = padded.slice(s![start..start + out_time, ..]);
                o += &window.dot(tap);
            }
        }
        if let Some(bias) = self.bias.as_ref() {
            out += bias;
        }
        out
    }
}

impl Parameters for Conv1d {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        out.insert(join(prefix, "weight"), self.weight.clone());
        if let Some(bias) = self.bias.as_ref() {
            out.insert(join(prefix, "bias"), bias.clone());
        }
    }
}

/// Transposed convolution used for upsampling in time. Weight layout is `(in, out, kernel)`, no
/// padding is supported as none of our models use it.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvTranspose1d {
    weight: Array3<f32>,
    bias: Option<Array<f32, Ix1>>,
    stride: usize,
}

impl ConvTranspose1d {
    pub fn new(
        weight: Array3<f32>,
        bias: Option<Array<f32, Ix1>>,
        stride: usize,
    ) -> anyhow::Result<Self> {
        if stride == 0 {
            anyhow::bail!("transposed convolution stride must be at least 1");
        }
        Ok(Self {
            weight,
            bias,
            stride,
        })
    }

    pub fn load(
        store: &ParamStore,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> anyhow::Result<Self> {
        let weight = store.get3("weight", (in_channels, out_channels, kernel_size))?;
        let bias = Some(store.get1("bias", out_channels)?);
        Self::new(weight, bias, stride)
    }

    pub fn init(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        std: f32,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            weight: normal_weight((in_channels, out_channels, kernel_size), std, rng),
            bias: Some(Array::zeros(out_channels)),
            stride: stride.max(1),
        }
    }

    pub fn output_len(&self, time: usize) -> usize {
        if time == 0 {
            0
        } else {
            (time - 1) * self.stride + self.weight.dim().2
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (batch, time, _) = x.dim();
        let out_channels = self.weight.dim().1;
        let out_time = self.output_len(time);
        let mut out = Array3::zeros((batch, out_time, out_channels));
        if time == 0 {
            return out;
        }

        for (mut o, x) in out.outer_iter_mut().zip(x.outer_iter()) {
            for k in 0..self.weight.dim().2 {
                let tap = self.weight.slice(s![.., .., k]);
                let contribution = x.dot(&tap);
                let end = k + (time - 1) * self.stride + 1;
                let mut rows = o.slice_mut(s![k..end;self.stride as isize, ..]);
                rows += &contribution;
            }
        }
        if let Some(bias) = self.bias.as_ref() {
            out += bias;
        }
        out
    }
}

impl Parameters for ConvTranspose1d {
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
    use ndarray::{arr1, arr3};

    #[test]
    fn same_padding_keeps_length() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv1d::init(4, 6, 5, 2, 1, 0.1, &mut rng);
        let x = Array3::ones((2, 11, 4));
        assert_eq!(conv.forward(&x).dim(), (2, 11, 6));

        let dilated = Conv1d::init(4, 4, 3, 3, 3, 0.1, &mut rng);
        assert_eq!(dilated.forward(&x).dim(), (2, 11, 4));
    }

    #[test]
    fn conv_matches_hand_computed() {
        // One channel in and out, kernel [1, 2, 3], no padding
        let conv = Conv1d::new(arr3(&[[[1.0, 2.0, 3.0]]]), Some(arr1(&[1.0])), 0, 1).unwrap();
        let x = arr3(&[[[1.0], [0.0], [2.0], [1.0]]]);
        let y = conv.forward(&x);
        // [1*1 + 0*2 + 2*3 + 1, 0*1 + 2*2 + 1*3 + 1]
        assert_eq!(y, arr3(&[[[8.0], [8.0]]]));
    }

    #[test]
    fn transpose_doubles_length() {
        let conv = ConvTranspose1d::new(arr3(&[[[1.0, 10.0]]]), None, 2).unwrap();
        let x = arr3(&[[[1.0], [2.0], [3.0]]]);
        let y = conv.forward(&x);
        assert_eq!(
            y,
            arr3(&[[[1.0], [10.0], [2.0], [20.0], [3.0], [30.0]]])
        );
    }
}
