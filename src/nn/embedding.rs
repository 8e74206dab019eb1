use super::*;
use ndarray::Array2;
use rand_distr::StandardNormal;

/// Lookup table from token id to vector. Ids outside the table are treated as padding and map to
/// a zero vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    table: Array2<f32>,
}

impl Embedding {
    pub fn new(table: Array2<f32>) -> Self {
        Self { table }
    }

    pub fn load(store: &ParamStore, vocab_size: usize, dim: usize) -> anyhow::Result<Self> {
        Ok(Self::new(store.get2("weight", (vocab_size, dim))?))
    }

    /// Normal initialisation with the padding row (id 0) zeroed.
    pub fn init(vocab_size: usize, dim: usize, std: f32, rng: &mut impl Rng) -> Self {
        let mut table = Array2::from_shape_simple_fn((vocab_size, dim), || {
            let v: f32 = rng.sample(StandardNormal);
            v * std
        });
        if vocab_size > 0 {
            table.row_mut(0).fill(0.0);
        }
        Self { table }
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    pub fn forward(&self, ids: &Array2<usize>) -> Array3<f32> {
        let (batch, time) = ids.dim();
        let mut out = Array3::zeros((batch, time, self.dim()));
        for ((b, t), id) in ids.indexed_iter() {
            if *id < self.vocab_size() {
                out.slice_mut(ndarray::s![b, t, ..]).assign(&self.table.row(*id));
            }
        }
        out
    }
}

impl Parameters for Embedding {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        out.insert(join(prefix, "weight"), self.table.clone());
    }
}
