use crate::vocab::{self, Vocab, EOS, PAD};
use anyhow::{bail, Context};
use candle_core::{Device, Tensor};
use flate2::bufread::GzDecoder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

fn read_corpus(path: &Path) -> anyhow::Result<String> {
    let file = File::open(path).with_context(|| format!("cannot open corpus {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut text = String::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(reader).read_to_string(&mut text)
    } else {
        reader.read_to_string(&mut text)
    }
    .with_context(|| format!("cannot read corpus {}", path.display()))?;
    Ok(text)
}

#[derive(Debug)]
pub struct Pair {
    pub source_text: String,
    pub target_text: String,
    pub source: Vec<String>,
    pub target: Vec<String>,
}

/// Article/summary pairs, one per line separated by a tab.
#[derive(Debug)]
pub struct Dataset {
    pub pairs: Vec<Pair>,
    pub src_len: usize,
    pub tgt_len: usize,
}

impl Dataset {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = read_corpus(path.as_ref())?;
        Self::from_text(&text)
    }

    pub fn from_text(text: &str) -> anyhow::Result<Self> {
        let mut pairs = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((src, tgt)) = line.split_once('\t') else {
                bail!("line {}: expected `article<TAB>summary`", lineno + 1);
            };
            let source = vocab::tokenize(src)?;
            let target = vocab::tokenize(tgt)?;
            if source.is_empty() || target.is_empty() {
                bail!("line {}: article and summary must both be non-empty", lineno + 1);
            }
            pairs.push(Pair {
                source_text: src.trim().to_owned(),
                target_text: tgt.trim().to_owned(),
                source,
                target,
            });
        }
        if pairs.is_empty() {
            bail!("corpus contains no pairs");
        }
        // pairs is non-empty here; the target side gets one extra slot for EOS
        let src_len = pairs.iter().map(|p| p.source.len()).max().unwrap_or_default();
        let tgt_len = pairs.iter().map(|p| p.target.len()).max().unwrap_or_default() + 1;
        Ok(Self {
            pairs,
            src_len,
            tgt_len,
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn build_vocab(&self, name: &str) -> Vocab {
        let mut vocab = Vocab::new(name);
        for pair in &self.pairs {
            vocab.add_sentence(&pair.source);
            vocab.add_sentence(&pair.target);
        }
        vocab
    }

    pub fn generator<'a>(
        &'a self,
        batch_size: usize,
        src_vocab: &'a Vocab,
        tgt_vocab: &'a Vocab,
        seed: u64,
    ) -> anyhow::Result<BatchGenerator<'a>> {
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..self.pairs.len()).collect();
        order.shuffle(&mut rng);
        Ok(BatchGenerator {
            dataset: self,
            src_vocab,
            tgt_vocab,
            batch_size,
            order,
            cursor: 0,
            rng,
        })
    }
}

pub struct Batch {
    pub examples: Vec<(String, String)>,
    /// `[src_len, batch]`, time-major.
    pub input: Tensor,
    /// `[tgt_len, batch]`, time-major, EOS-terminated.
    pub target: Tensor,
    pub input_lengths: Vec<usize>,
}

/// Endless stream of padded batches. The visiting order is reshuffled after every full pass.
pub struct BatchGenerator<'a> {
    dataset: &'a Dataset,
    src_vocab: &'a Vocab,
    tgt_vocab: &'a Vocab,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl BatchGenerator<'_> {
    fn next_index(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let idx = self.order[self.cursor];
        self.cursor += 1;
        idx
    }

    fn make_batch(&mut self) -> candle_core::Result<Batch> {
        let dataset = self.dataset;
        let mut encoded: Vec<(Vec<u32>, Vec<u32>, &Pair)> = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let pair = &dataset.pairs[self.next_index()];
            let src = self.src_vocab.encode(&pair.source);
            let mut tgt = self.tgt_vocab.encode(&pair.target);
            tgt.push(EOS);
            encoded.push((src, tgt, pair));
        }
        encoded.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let batch = encoded.len();
        let src_len = encoded.iter().map(|e| e.0.len()).max().unwrap_or(0);
        let tgt_len = encoded.iter().map(|e| e.1.len()).max().unwrap_or(0);

        let mut input = vec![PAD; src_len * batch];
        let mut target = vec![PAD; tgt_len * batch];
        for (b, (src, tgt, _)) in encoded.iter().enumerate() {
            for (t, &id) in src.iter().enumerate() {
                input[t * batch + b] = id;
            }
            for (t, &id) in tgt.iter().enumerate() {
                target[t * batch + b] = id;
            }
        }

        Ok(Batch {
            examples: encoded
                .iter()
                .map(|(_, _, p)| (p.source_text.clone(), p.target_text.clone()))
                .collect(),
            input_lengths: encoded.iter().map(|e| e.0.len()).collect(),
            input: Tensor::from_vec(input, (src_len, batch), &Device::Cpu)?,
            target: Tensor::from_vec(target, (tgt_len, batch), &Device::Cpu)?,
        })
    }
}

impl Iterator for BatchGenerator<'_> {
    type Item = candle_core::Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.make_batch())
    }
}
