use crate::config::TrainConfig;
use crate::model::Seq2SeqConfig;
use crate::vocab::Vocab;
use anyhow::Context;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything needed to rebuild the model next to its weights.
#[derive(Serialize, Deserialize)]
pub struct Sidecar {
    pub train: TrainConfig,
    pub model: Seq2SeqConfig,
    pub vocab: Vocab,
    pub plot_losses: Vec<f32>,
}

pub fn sidecar_path(weights: &Path) -> PathBuf {
    weights.with_extension("json")
}

pub fn save(weights: &Path, varmap: &VarMap, sidecar: &Sidecar) -> anyhow::Result<()> {
    if let Some(dir) = weights.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }
    varmap
        .save(weights)
        .with_context(|| format!("cannot write weights to {}", weights.display()))?;
    let meta = sidecar_path(weights);
    fs::write(&meta, serde_json::to_string_pretty(sidecar)?)
        .with_context(|| format!("cannot write {}", meta.display()))?;
    tracing::info!("saved checkpoint to {}", weights.display());
    Ok(())
}

pub fn load_weights(weights: &Path, varmap: &mut VarMap) -> anyhow::Result<()> {
    varmap
        .load(weights)
        .with_context(|| format!("cannot load weights from {}", weights.display()))?;
    tracing::info!("resumed from {}", weights.display());
    Ok(())
}

pub fn load_sidecar(weights: &Path) -> anyhow::Result<Sidecar> {
    let meta = sidecar_path(weights);
    let json = fs::read_to_string(&meta).with_context(|| format!("cannot read {}", meta.display()))?;
    let mut sidecar: Sidecar = serde_json::from_str(&json)?;
    sidecar.vocab.reindex();
    Ok(sidecar)
}
