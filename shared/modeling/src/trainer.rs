use std::time::Instant;

use anyhow::{bail, Result};
use candle_core::Tensor;
use sae_data_provider::TokenizedDataset;
use tracing::{debug, info, trace};

use crate::ModelHandle;

/// Something that trains until its data runs out.
pub trait Trainer {
    /// Runs the whole training loop. Called exactly once.
    fn fit(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerSettings {
    pub batch_size: usize,
    pub grad_acc_steps: usize,
    pub micro_acc_steps: usize,
    pub save_every: usize,
    pub log_every: usize,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            batch_size: 8,
            grad_acc_steps: 1,
            micro_acc_steps: 1,
            save_every: 1000,
            log_every: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitSummary {
    pub batches: usize,
    pub micro_batches: usize,
    pub optimizer_steps: usize,
    pub tokens: usize,
}

/// Feeds a rank's shard to the device batch by batch.
///
/// Each batch of `batch_size` sequences is split into `micro_acc_steps`
/// micro-batches that are materialized as `(n, seq_len)` token tensors on the
/// model's device; every `grad_acc_steps` batches count as one optimizer step.
/// A trailing batch smaller than `batch_size` is dropped.
pub struct DataFeedTrainer {
    settings: TrainerSettings,
    data: TokenizedDataset,
    model: ModelHandle,
    summary: Option<FitSummary>,
}

impl DataFeedTrainer {
    pub fn new(settings: TrainerSettings, data: TokenizedDataset, model: ModelHandle) -> Self {
        Self {
            settings,
            data,
            model,
            summary: None,
        }
    }

    pub fn summary(&self) -> Option<FitSummary> {
        self.summary
    }

    fn micro_batch_tensor(&self, start: usize, len: usize) -> Result<Tensor> {
        let seq_len = self.data.seq_len();
        let ids: Vec<u32> = self.data.sequences()[start..start + len]
            .iter()
            .flat_map(|sequence| sequence.input_ids.iter().copied())
            .collect();
        Ok(Tensor::from_vec(ids, (len, seq_len), self.model.device())?)
    }
}

impl Trainer for DataFeedTrainer {
    fn fit(&mut self) -> Result<()> {
        if self.summary.is_some() {
            bail!("fit() was already called on this trainer");
        }
        let TrainerSettings {
            batch_size,
            grad_acc_steps,
            micro_acc_steps,
            save_every,
            log_every,
        } = self.settings.clone();
        if batch_size == 0 || micro_acc_steps == 0 || grad_acc_steps == 0 {
            bail!("batch size and accumulation steps must be positive");
        }
        let micro_size = batch_size.div_ceil(micro_acc_steps);
        let num_batches = self.data.len() / batch_size;
        info!(
            model = self.model.name(),
            sequences = self.data.len(),
            seq_len = self.data.seq_len(),
            batches = num_batches,
            "Starting training"
        );

        let start_time = Instant::now();
        let mut summary = FitSummary::default();
        for batch in 0..num_batches {
            let batch_start = batch * batch_size;
            let mut offset = 0;
            while offset < batch_size {
                let len = micro_size.min(batch_size - offset);
                let tokens = self.micro_batch_tensor(batch_start + offset, len)?;
                trace!(batch, offset, shape = ?tokens.dims(), "Fed micro batch");
                summary.tokens += tokens.elem_count();
                summary.micro_batches += 1;
                offset += len;
            }
            summary.batches += 1;

            if summary.batches % grad_acc_steps == 0 {
                summary.optimizer_steps += 1;
                let step = summary.optimizer_steps;
                if step % log_every.max(1) == 0 {
                    let elapsed = start_time.elapsed().as_secs_f64();
                    info!(
                        step,
                        tokens = summary.tokens,
                        tokens_per_sec = summary.tokens as f64 / elapsed.max(f64::EPSILON),
                        "Training progress"
                    );
                }
                if save_every > 0 && step % save_every == 0 {
                    debug!(step, "Checkpoint boundary");
                }
            }
        }

        info!(
            batches = summary.batches,
            optimizer_steps = summary.optimizer_steps,
            tokens = summary.tokens,
            duration_secs = start_time.elapsed().as_secs_f32(),
            "Finished training"
        );
        self.summary = Some(summary);
        Ok(())
    }
}
