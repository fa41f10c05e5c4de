use crate::config::TrainConfig;
use crate::data::Batch;
use crate::model::{NllLoss, Seq2Seq};
use crate::vocab::{Vocab, PAD};
use anyhow::bail;
use candle_core::{Device, Result};
use candle_nn::{Optimizer, VarMap, SGD};

pub struct TrainParams {
    pub n_batches: usize,
    pub n_epochs: usize,
    pub plot_every: usize,
    pub learning_rate: f64,
}

impl From<&TrainConfig> for TrainParams {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            n_batches: cfg.n_batches,
            n_epochs: cfg.n_epochs,
            plot_every: cfg.plot_every,
            learning_rate: cfg.learning_rate,
        }
    }
}

/// Periodic loss samples for plotting. The cache survives epoch boundaries, so a
/// period can straddle two epochs.
pub struct LossHistory {
    plot_every: usize,
    cached: Vec<f32>,
    plot_losses: Vec<f32>,
}

impl LossHistory {
    pub fn new(plot_every: usize) -> Self {
        Self {
            plot_every,
            cached: Vec::new(),
            plot_losses: Vec::new(),
        }
    }

    /// `batch_count` is 1-based within the current epoch. Returns the new sample, if any.
    pub fn record(&mut self, batch_count: usize, loss: f32) -> Option<f32> {
        self.cached.push(loss);
        if batch_count % self.plot_every != 0 {
            return None;
        }
        let avg = self.cached.iter().sum::<f32>() / self.cached.len() as f32;
        self.cached.clear();
        self.plot_losses.push(avg);
        Some(avg)
    }

    pub fn into_losses(self) -> Vec<f32> {
        self.plot_losses
    }
}

/// One optimizer step. Returns the summed loss divided by the target length.
pub fn train_batch(
    batch: &Batch,
    model: &Seq2Seq,
    optimizer: &mut SGD,
    criterion: &NllLoss,
    device: &Device,
) -> Result<f32> {
    let input = batch.input.to_device(device)?;
    let target = batch.target.to_device(device)?;
    let loss = model.forward(&input, &target, &batch.input_lengths, criterion)?;
    optimizer.backward_step(&loss)?;

    let target_length = batch.target.dim(0)?;
    Ok(loss.to_vec0::<f32>()? / target_length as f32)
}

fn log_sample(model: &Seq2Seq, vocab: &Vocab, batch: &Batch, device: &Device) -> Result<()> {
    let Some((source, reference)) = batch.examples.first() else {
        return Ok(());
    };
    let input = batch.input.narrow(1, 0, 1)?.contiguous()?.to_device(device)?;
    let decoded = model.greedy_decode(&input, &batch.input_lengths[..1], None)?;
    tracing::info!("INPUT: {source}");
    tracing::info!("REFERENCE: {reference}");
    tracing::info!("OUTPUT: {}", vocab.decode(&decoded[0]));
    Ok(())
}

/// Runs `n_epochs` of `n_batches` SGD steps, pulling batches from `generator`.
/// Returns the averaged loss samples taken every `plot_every` batches.
pub fn train<I>(
    generator: &mut I,
    vocab: &Vocab,
    model: &Seq2Seq,
    varmap: &VarMap,
    params: &TrainParams,
    device: &Device,
) -> anyhow::Result<Vec<f32>>
where
    I: Iterator<Item = Result<Batch>>,
{
    if params.plot_every == 0 {
        bail!("plot_every must be positive");
    }
    let mut optimizer = SGD::new(varmap.all_vars(), params.learning_rate)?;
    let criterion = NllLoss::new(PAD);
    let mut history = LossHistory::new(params.plot_every);

    for epoch in 1..=params.n_epochs {
        let mut epoch_loss = 0.0f64;
        let mut last_batch = None;

        for batch_count in 1..=params.n_batches {
            let Some(batch) = generator.next() else {
                bail!("batch generator ran dry in epoch {epoch}");
            };
            let batch = batch?;
            let loss = train_batch(&batch, model, &mut optimizer, &criterion, device)?;

            epoch_loss += loss as f64;
            let epoch_avg_loss = epoch_loss / batch_count as f64;
            tracing::debug!(
                "epoch {epoch} [{batch_count}/{}] loss={epoch_avg_loss:.6}",
                params.n_batches
            );

            if let Some(sample) = history.record(batch_count, loss) {
                tracing::info!("epoch {epoch} batch {batch_count}: period avg loss {sample:.6}");
            }
            last_batch = Some(batch);
        }

        if let Some(batch) = last_batch {
            tracing::info!(
                "epoch {epoch} done, avg loss {:.6}",
                epoch_loss / params.n_batches as f64
            );
            log_sample(model, vocab, &batch, device)?;
        }
    }

    Ok(history.into_losses())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{self, Sidecar};
    use crate::data::Dataset;
    use crate::model::Seq2SeqConfig;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    const CORPUS: &str = "stocks rose sharply on strong earnings\tstocks rose\n\
                          heavy rain flooded the low streets overnight\train floods streets\n\
                          the team won the final match\tteam wins\n\
                          new bridge opens to traffic next week\tbridge opens\n";

    fn setup(hidden: usize) -> (Dataset, Vocab, VarMap, Seq2Seq, Seq2SeqConfig) {
        let ds = Dataset::from_text(CORPUS).unwrap();
        let vocab = ds.build_vocab("eng");
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = Seq2SeqConfig {
            vocab_size: vocab.len(),
            embed_size: 8,
            hidden_size: hidden,
            tgt_len: ds.tgt_len,
        };
        let model = Seq2Seq::new(&cfg, vb).unwrap();
        (ds, vocab, varmap, model, cfg)
    }

    #[test]
    fn history_samples_every_period() {
        let mut h = LossHistory::new(2);
        assert_eq!(h.record(1, 1.0), None);
        assert_eq!(h.record(2, 3.0), Some(2.0));
        assert_eq!(h.record(3, 5.0), None);
        assert_eq!(h.record(4, 7.0), Some(6.0));
        assert_eq!(h.into_losses(), vec![2.0, 6.0]);
    }

    #[test]
    fn history_carries_leftovers_into_next_epoch() {
        // three batches per epoch, sample every two
        let mut h = LossHistory::new(2);
        for (count, loss) in [(1, 1.0), (2, 1.0), (3, 4.0)] {
            h.record(count, loss);
        }
        // new epoch restarts the count; the 4.0 from the last epoch is still cached
        assert_eq!(h.record(1, 2.0), None);
        assert_eq!(h.record(2, 6.0), Some(4.0));
        assert_eq!(h.into_losses(), vec![1.0, 4.0]);
    }

    #[test]
    fn train_batch_reports_per_step_loss() {
        let (ds, vocab, varmap, model, _) = setup(6);
        let mut batches = ds.generator(2, &vocab, &vocab, 3).unwrap();
        let batch = batches.next().unwrap().unwrap();
        let mut sgd = SGD::new(varmap.all_vars(), 0.01).unwrap();
        let criterion = NllLoss::new(PAD);

        let summed = model
            .forward(&batch.input, &batch.target, &batch.input_lengths, &criterion)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        let per_step = train_batch(&batch, &model, &mut sgd, &criterion, &Device::Cpu).unwrap();
        let steps = batch.target.dim(0).unwrap() as f32;
        assert!((per_step - summed / steps).abs() < 1e-4);
    }

    #[test]
    fn training_reduces_loss_on_a_fixed_batch() {
        let (ds, vocab, varmap, model, _) = setup(16);
        let mut batches = ds.generator(4, &vocab, &vocab, 0).unwrap();
        let batch = batches.next().unwrap().unwrap();
        let mut sgd = SGD::new(varmap.all_vars(), 0.1).unwrap();
        let criterion = NllLoss::new(PAD);

        let first = train_batch(&batch, &model, &mut sgd, &criterion, &Device::Cpu).unwrap();
        let mut last = first;
        for _ in 0..40 {
            last = train_batch(&batch, &model, &mut sgd, &criterion, &Device::Cpu).unwrap();
        }
        assert!(last < first, "{last} !< {first}");
    }

    #[test]
    fn train_records_expected_number_of_samples() {
        let (ds, vocab, varmap, model, _) = setup(6);
        let mut batches = ds.generator(2, &vocab, &vocab, 11).unwrap();
        let params = TrainParams {
            n_batches: 5,
            n_epochs: 2,
            plot_every: 2,
            learning_rate: 0.01,
        };
        let losses = train(&mut batches, &vocab, &model, &varmap, &params, &Device::Cpu).unwrap();
        // 10 batches total, one sample per 2 regardless of epoch boundaries inside a period
        assert_eq!(losses.len(), 4);
        assert!(losses.iter().all(|l| l.is_finite() && *l > 0.0));
    }

    #[test]
    fn params_follow_train_config() {
        let cfg = TrainConfig {
            n_batches: 7,
            plot_every: 3,
            ..TrainConfig::default()
        };
        let params = TrainParams::from(&cfg);
        assert_eq!(params.n_batches, 7);
        assert_eq!(params.plot_every, 3);
        assert_eq!(params.n_epochs, cfg.n_epochs);
        assert_eq!(params.learning_rate, cfg.learning_rate);
    }

    #[test]
    fn zero_plot_every_is_rejected() {
        let (ds, vocab, varmap, model, _) = setup(6);
        let mut batches = ds.generator(2, &vocab, &vocab, 0).unwrap();
        let params = TrainParams {
            plot_every: 0,
            ..TrainParams::from(&TrainConfig::default())
        };
        assert!(train(&mut batches, &vocab, &model, &varmap, &params, &Device::Cpu).is_err());
    }

    #[test]
    fn no_epochs_trains_nothing() {
        let (ds, vocab, varmap, model, _) = setup(6);
        let mut batches = ds.generator(2, &vocab, &vocab, 0).unwrap();
        let params = TrainParams {
            n_epochs: 0,
            ..TrainParams::from(&TrainConfig::default())
        };
        let losses = train(&mut batches, &vocab, &model, &varmap, &params, &Device::Cpu).unwrap();
        assert!(losses.is_empty());
    }

    #[test]
    fn checkpoint_roundtrip() {
        let (_, vocab, varmap, _, model_cfg) = setup(6);
        let dir = std::env::temp_dir().join(format!("batsumm-ckpt-{}", std::process::id()));
        let weights = dir.join("batsumm.safetensors");
        let sidecar = Sidecar {
            train: TrainConfig::default(),
            model: model_cfg.clone(),
            vocab: vocab.clone(),
            plot_losses: vec![3.5, 2.25],
        };
        checkpoint::save(&weights, &varmap, &sidecar).unwrap();

        let restored = checkpoint::load_sidecar(&weights).unwrap();
        assert_eq!(restored.plot_losses, vec![3.5, 2.25]);
        assert_eq!(restored.vocab.id("bridge"), vocab.id("bridge"));
        assert_eq!(restored.model.vocab_size, model_cfg.vocab_size);

        let mut fresh = VarMap::new();
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &Device::Cpu);
        let _model = Seq2Seq::new(&restored.model, vb).unwrap();
        checkpoint::load_weights(&weights, &mut fresh).unwrap();

        let saved = varmap.data().lock().unwrap();
        let loaded = fresh.data().lock().unwrap();
        let name = "embedding.weight";
        let a: Vec<Vec<f32>> = saved[name].as_tensor().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = loaded[name].as_tensor().to_vec2().unwrap();
        assert_eq!(a, b);
        drop((saved, loaded));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
