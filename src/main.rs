mod checkpoint;
mod config;
mod data;
mod model;
mod train;
mod vocab;

use crate::checkpoint::Sidecar;
use crate::config::{Args, TrainConfig};
use crate::model::{Seq2Seq, Seq2SeqConfig};
use crate::train::{train, TrainParams};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use data::Dataset;
use tracing_subscriber::EnvFilter;

fn run(cfg: &TrainConfig, dev: &Device) -> anyhow::Result<()> {
    let ds = Dataset::new(&cfg.corpus)?;
    // a resumed run keeps the vocabulary, model shape and loss history it was saved with
    let previous = if cfg.resume {
        Some(checkpoint::load_sidecar(&cfg.checkpoint)?)
    } else {
        None
    };
    let (vocab, model_cfg, mut plot_losses) = match previous {
        Some(saved) => {
            let model_cfg = Seq2SeqConfig {
                tgt_len: ds.tgt_len,
                ..saved.model
            };
            (saved.vocab, model_cfg, saved.plot_losses)
        }
        None => {
            let vocab = ds.build_vocab(&cfg.vocab_name);
            let model_cfg = Seq2SeqConfig {
                vocab_size: vocab.len(),
                embed_size: cfg.embed_size,
                hidden_size: cfg.hidden_size,
                tgt_len: ds.tgt_len,
            };
            (vocab, model_cfg, Vec::new())
        }
    };
    tracing::info!(
        "{} pairs, vocab {} ({} words), src_len {}, tgt_len {}",
        ds.len(),
        vocab.name(),
        vocab.len(),
        ds.src_len,
        ds.tgt_len
    );
    let mut training_data = ds.generator(cfg.batch_size, &vocab, &vocab, cfg.seed)?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let model = Seq2Seq::new(&model_cfg, vb)?;
    if cfg.resume {
        checkpoint::load_weights(&cfg.checkpoint, &mut varmap)?;
    }

    let params = TrainParams::from(cfg);
    plot_losses.extend(train(&mut training_data, &vocab, &model, &varmap, &params, dev)?);

    let sidecar = Sidecar {
        train: TrainConfig {
            embed_size: model_cfg.embed_size,
            hidden_size: model_cfg.hidden_size,
            ..cfg.clone()
        },
        model: model_cfg,
        vocab: vocab.clone(),
        plot_losses,
    };
    checkpoint::save(&cfg.checkpoint, &varmap, &sidecar)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batsumm=info")),
        )
        .init();

    let cfg: TrainConfig = Args::parse().into();
    let dev = Device::cuda_if_available(0)?;
    tracing::info!("using device {dev:?}");
    run(&cfg, &dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    const CORPUS: &str = "stocks rose sharply on strong earnings\tstocks rose\n\
                          heavy rain flooded the low streets overnight\train floods streets\n\
                          the team won the final match\tteam wins\n\
                          new bridge opens to traffic next week\tbridge opens\n";

    fn workspace(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("batsumm-run-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("corpus.txt"), CORPUS).unwrap();
        dir
    }

    fn small_run(dir: &Path) -> TrainConfig {
        TrainConfig {
            corpus: dir.join("corpus.txt"),
            checkpoint: dir.join("ckpt/batsumm.safetensors"),
            n_epochs: 1,
            n_batches: 4,
            batch_size: 2,
            plot_every: 2,
            embed_size: 8,
            hidden_size: 6,
            ..TrainConfig::default()
        }
    }

    fn weights(path: &Path) -> HashMap<String, Vec<f32>> {
        candle_core::safetensors::load(path, &Device::Cpu)
            .unwrap()
            .into_iter()
            .map(|(name, t): (String, Tensor)| (name, t.flatten_all().unwrap().to_vec1().unwrap()))
            .collect()
    }

    #[test]
    fn resume_uses_saved_model_shape_and_weights() {
        let dir = workspace("shape");
        let first = small_run(&dir);
        run(&first, &Device::Cpu).unwrap();
        let saved = checkpoint::load_sidecar(&first.checkpoint).unwrap();
        let saved_weights = weights(&first.checkpoint);

        // size flags left at their defaults; no training, so weights must come back untouched
        let resumed = TrainConfig {
            resume: true,
            n_epochs: 0,
            embed_size: TrainConfig::default().embed_size,
            hidden_size: TrainConfig::default().hidden_size,
            ..first.clone()
        };
        run(&resumed, &Device::Cpu).unwrap();

        let after = checkpoint::load_sidecar(&resumed.checkpoint).unwrap();
        assert_eq!(after.model.hidden_size, 6);
        assert_eq!(after.model.embed_size, 8);
        assert_eq!(after.train.hidden_size, 6);
        assert_eq!(after.vocab.len(), saved.vocab.len());
        for word in ["stocks", "floods", "bridge"] {
            assert_eq!(after.vocab.id(word), saved.vocab.id(word));
        }
        assert_eq!(weights(&resumed.checkpoint), saved_weights);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn resume_appends_to_loss_history() {
        let dir = workspace("history");
        let first = small_run(&dir);
        run(&first, &Device::Cpu).unwrap();
        let before = checkpoint::load_sidecar(&first.checkpoint).unwrap().plot_losses;
        assert_eq!(before.len(), 2);

        let resumed = TrainConfig {
            resume: true,
            ..first.clone()
        };
        run(&resumed, &Device::Cpu).unwrap();
        let after = checkpoint::load_sidecar(&resumed.checkpoint).unwrap().plot_losses;
        assert_eq!(after.len(), 4);
        assert_eq!(after[..2], before[..]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn resume_without_checkpoint_fails() {
        let dir = workspace("missing");
        let cfg = TrainConfig {
            resume: true,
            ..small_run(&dir)
        };
        assert!(run(&cfg, &Device::Cpu).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
