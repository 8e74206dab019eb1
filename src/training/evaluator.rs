use super::reporter::{DictSummary, Observation, Reporter};
use crate::nn::Mode;
use tracing::info;

/// The part of a model an evaluator drives: one forward pass over a batch, reporting whatever
/// metrics it likes.
pub trait EvaluateCore<B> {
    fn evaluate_core(&self, batch: &B, mode: Mode, reporter: &mut Reporter)
        -> anyhow::Result<()>;
}

/// Runs a model over a fixed set of batches in [`Mode::Eval`] and averages the reports.
#[derive(Clone, Debug)]
pub struct StandardEvaluator<B> {
    batches: Vec<B>,
    name: String,
}

impl<B> StandardEvaluator<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self {
            batches,
            name: "validation".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Mean of every value reported over the batches.
    pub fn evaluate<M: EvaluateCore<B>>(&self, model: &M) -> anyhow::Result<Observation> {
        let mut summary = DictSummary::new();
        for batch in &self.batches {
            let mut reporter = Reporter::new();
            model.evaluate_core(batch, Mode::Eval, &mut reporter)?;
            summary.add(reporter.observation());
        }
        Ok(summary.compute_mean())
    }

    /// Evaluates and reports the means under this evaluator's name.
    pub fn run<M: EvaluateCore<B>>(
        &self,
        model: &M,
        reporter: &mut Reporter,
    ) -> anyhow::Result<()> {
        let summary = self.evaluate(model)?;
        info!("{}: {:?}", self.name, summary);
        reporter.scope(&self.name, |r| {
            for (k, v) in &summary {
                r.report(k, *v);
            }
        });
        Ok(())
    }
}
