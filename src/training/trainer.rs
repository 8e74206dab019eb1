//! The outer training loop. The loop owns the bookkeeping (step counting, execution modes,
//! reporting, evaluation and checkpoints) while the actual parameter update is supplied by an
//! [`Updater`], there's no automatic differentiation here.
use super::evaluator::{EvaluateCore, StandardEvaluator};
use super::reporter::{DictSummary, Reporter};
use crate::checkpoint::{latest_checkpoint, Checkpoint, OutputTree};
use crate::nn::Mode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub trait Updater {
    type Batch;

    /// One optimisation step on a batch. Losses and the like go to the reporter.
    fn update(
        &mut self,
        batch: &Self::Batch,
        mode: Mode,
        reporter: &mut Reporter,
    ) -> anyhow::Result<()>;

    fn state_dict(&self) -> Checkpoint;

    fn load_state_dict(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    pub max_iterations: usize,
    #[serde(default = "default_interval")]
    pub checkpoint_interval: usize,
    #[serde(default = "default_interval")]
    pub eval_interval: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Base seed for the per step dropout masks
    #[serde(default)]
    pub seed: u64,
}

fn default_interval() -> usize {
    1000
}

fn default_log_interval() -> usize {
    100
}

impl TrainerConfig {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            checkpoint_interval: default_interval(),
            eval_interval: default_interval(),
            log_interval: default_log_interval(),
            seed: 0,
        }
    }
}

pub struct Trainer<U> {
    updater: U,
    output: OutputTree,
    config: TrainerConfig,
    step: usize,
}

impl<U> Trainer<U> {
    pub fn new(
        updater: U,
        output: impl AsRef<Path>,
        config: TrainerConfig,
    ) -> anyhow::Result<Self> {
        let intervals = [
            config.checkpoint_interval,
            config.eval_interval,
            config.log_interval,
        ];
        if intervals.contains(&0) {
            anyhow::bail!("trainer intervals must be positive");
        }
        Ok(Self {
            updater,
            output: OutputTree::create(output)?,
            config,
            step: 0,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    pub fn output(&self) -> &OutputTree {
        &self.output
    }

    pub fn into_updater(self) -> U {
        self.updater
    }

    fn mode(&self) -> Mode {
        Mode::Train {
            seed: self
                .config
                .seed
                .wrapping_mul(0x9e37_79b9_7f4a_7c15)
                .wrapping_add(self.step as u64),
        }
    }
}

impl<U: Updater> Trainer<U> {
    /// Loads the latest checkpoint in the output directory, continuing from its step. Returns
    /// the step resumed from.
    pub fn resume(&mut self) -> anyhow::Result<Option<usize>> {
        match latest_checkpoint(self.output.checkpoint_dir())? {
            Some((step, path)) => {
                let checkpoint = Checkpoint::load(&path)?;
                self.updater.load_state_dict(&checkpoint)?;
                self.step = step;
                info!("Resuming from step {}", step);
                Ok(Some(step))
            }
            None => Ok(None),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self.output.checkpoint_path(self.step);
        self.updater.state_dict().save(&path)?;
        info!("Saved checkpoint {}", path.display());
        Ok(())
    }

    /// Cycles through `batches` until `max_iterations` updates have been made in total.
    pub fn run(
        &mut self,
        batches: &[U::Batch],
        evaluator: Option<&StandardEvaluator<U::Batch>>,
    ) -> anyhow::Result<()>
    where
        U: EvaluateCore<U::Batch>,
    {
        if batches.is_empty() {
            anyhow::bail!("no training batches");
        }
        let mut reporter = Reporter::new();
        let mut summary = DictSummary::new();
        while self.step < self.config.max_iterations {
            let batch = &batches[self.step % batches.len()];
            let mode = self.mode();
            self.step += 1;
            reporter.scope("main", |r| self.updater.update(batch, mode, r))?;
            debug!("Step {}: {:?}", self.step, reporter.observation());
            summary.add(&reporter.take());

            if self.step % self.config.log_interval == 0 && !summary.is_empty() {
                info!("Step {}: {:?}", self.step, summary.compute_mean());
                summary = DictSummary::new();
            }
            if let Some(evaluator) = evaluator {
                if self.step % self.config.eval_interval == 0 {
                    evaluator.run(&self.updater, &mut reporter)?;
                    reporter.take();
                }
            }
            if self.step % self.config.checkpoint_interval == 0
                || self.step == self.config.max_iterations
            {
                self.save()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::checkpoint_path;
    use ndarray::arr1;

    /// Moves a scalar towards each batch value.
    #[derive(Default)]
    struct Average {
        value: f32,
        modes: Vec<Mode>,
    }

    impl Updater for Average {
        type Batch = f32;

        fn update(
            &mut self,
            batch: &f32,
            mode: Mode,
            reporter: &mut Reporter,
        ) -> anyhow::Result<()> {
            self.modes.push(mode);
            self.value += 0.5 * (batch - self.value);
            reporter.report("loss", (batch - self.value).abs());
            Ok(())
        }

        fn state_dict(&self) -> Checkpoint {
            let mut ckpt = Checkpoint::new();
            ckpt.insert("value", arr1(&[self.value]));
            ckpt
        }

        fn load_state_dict(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
            let value = checkpoint
                .get("value")
                .and_then(|x| x.iter().next())
                .ok_or_else(|| anyhow::anyhow!("missing value"))?;
            self.value = *value;
            Ok(())
        }
    }

    impl EvaluateCore<f32> for Average {
        fn evaluate_core(
            &self,
            batch: &f32,
            _mode: Mode,
            reporter: &mut Reporter,
        ) -> anyhow::Result<()> {
            reporter.report("error", (batch - self.value).abs());
            Ok(())
        }
    }

    #[test]
    fn checkpoints_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainerConfig {
            checkpoint_interval: 4,
            eval_interval: 2,
            log_interval: 1,
            ..TrainerConfig::new(10)
        };
        let evaluator = StandardEvaluator::new(vec![1.0]);
        let mut trainer = Trainer::new(Average::default(), dir.path(), config.clone()).unwrap();
        trainer.run(&[1.0, 1.0], Some(&evaluator)).unwrap();
        assert_eq!(trainer.step(), 10);

        let checkpoints = dir.path().join("checkpoints");
        for step in [4, 8, 10] {
            assert!(checkpoint_path(&checkpoints, step).exists());
        }
        assert!(!checkpoint_path(&checkpoints, 2).exists());

        // Every step gets a different dropout seed
        let modes = &trainer.updater().modes;
        assert_eq!(modes.len(), 10);
        assert!(modes.iter().all(|m| m.is_training()));
        assert_ne!(modes[0], modes[1]);

        let value = trainer.updater().value;
        let mut resumed =
            Trainer::new(Average::default(), dir.path(), TrainerConfig::new(12)).unwrap();
        assert_eq!(resumed.resume().unwrap(), Some(10));
        assert_eq!(resumed.updater().value, value);
        resumed.run(&[1.0], None).unwrap();
        assert_eq!(resumed.updater().modes.len(), 2);
        assert!(checkpoint_path(&checkpoints, 12).exists());
    }

    #[test]
    fn nothing_to_train_on() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(Average::default(), dir.path(), TrainerConfig::new(1)).unwrap();
        assert!(trainer.run(&[], None).is_err());
        assert_eq!(trainer.resume().unwrap(), None);
    }
}
