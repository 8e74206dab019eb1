use super::*;

/// Two linear layers with relu and dropout, applied to decoder inputs before attention.
#[derive(Clone, Debug, PartialEq)]
pub struct PreNet {
    linear1: Linear,
    linear2: Linear,
    dropout1: Dropout,
    dropout2: Dropout,
}

impl PreNet {
    pub fn load(
        store: &ParamStore,
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
        dropout: f32,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            linear1: Linear::load(&store.pp("linear1"), input_size, hidden_size, true)?,
            linear2: Linear::load(&store.pp("linear2"), hidden_size, output_size, true)?,
            dropout1: Dropout::new(dropout, &join(store.prefix(), "dropout1")),
            dropout2: Dropout::new(dropout, &join(store.prefix(), "dropout2")),
        })
    }

    pub fn init(
        prefix: &str,
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
        dropout: f32,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            linear1: Linear::init_xavier(input_size, hidden_size, true, rng),
            linear2: Linear::init_xavier(hidden_size, output_size, true, rng),
            dropout1: Dropout::new(dropout, &join(prefix, "dropout1")),
            dropout2: Dropout::new(dropout, &join(prefix, "dropout2")),
        }
    }

    pub fn forward(&self, x: &Array3<f32>, mode: Mode) -> Array3<f32> {
        let x = self.dropout1.forward(relu(self.linear1.forward(x)), mode);
        self.dropout2.forward(relu(self.linear2.forward(&x)), mode)
    }
}

impl Parameters for PreNet {
    fn collect_parameters(&self, prefix: &str, out: &mut Checkpoint) {
        self.linear1.collect_parameters(&join(prefix, "linear1"), out);
        self.linear2.collect_parameters(&join(prefix, "linear2"), out);
    }
}
