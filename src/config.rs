use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainConfig {
    pub corpus: PathBuf,
    pub checkpoint: PathBuf,
    pub vocab_name: String,
    pub n_epochs: usize,
    pub n_batches: usize,
    pub batch_size: usize,
    pub plot_every: usize,
    pub learning_rate: f64,
    pub embed_size: usize,
    pub hidden_size: usize,
    pub seed: u64,
    pub resume: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            corpus: PathBuf::from("data/org-sht.txt"),
            checkpoint: PathBuf::from("checkpoints/batsumm.safetensors"),
            vocab_name: "eng".to_owned(),
            n_epochs: 5,
            n_batches: 1000,
            batch_size: 4,
            plot_every: 20,
            learning_rate: 0.01,
            embed_size: 100,
            hidden_size: 100,
            seed: 0,
            resume: false,
        }
    }
}

/// Train the batch summarizer. Every flag defaults to the stock training run.
#[derive(Parser, Debug)]
#[command(name = "batsumm", version)]
pub struct Args {
    /// Tab-separated `article<TAB>summary` corpus, optionally gzipped
    #[arg(long)]
    corpus: Option<PathBuf>,
    /// Where the safetensors weights are written
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    /// Batches per epoch
    #[arg(long)]
    batches: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Record one averaged loss sample every N batches
    #[arg(long)]
    plot_every: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    embed_size: Option<usize>,
    #[arg(long)]
    hidden_size: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Start from the weights already at the checkpoint path
    #[arg(long)]
    resume: bool,
}

impl From<Args> for TrainConfig {
    fn from(args: Args) -> Self {
        let d = TrainConfig::default();
        Self {
            corpus: args.corpus.unwrap_or(d.corpus),
            checkpoint: args.checkpoint.unwrap_or(d.checkpoint),
            vocab_name: d.vocab_name,
            n_epochs: args.epochs.unwrap_or(d.n_epochs),
            n_batches: args.batches.unwrap_or(d.n_batches),
            batch_size: args.batch_size.unwrap_or(d.batch_size),
            plot_every: args.plot_every.unwrap_or(d.plot_every),
            learning_rate: args.lr.unwrap_or(d.learning_rate),
            embed_size: args.embed_size.unwrap_or(d.embed_size),
            hidden_size: args.hidden_size.unwrap_or(d.hidden_size),
            seed: args.seed.unwrap_or(d.seed),
            resume: args.resume,
        }
    }
}
