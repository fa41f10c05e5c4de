use crate::vocab::{EOS, SOS};
use candle_core::{Device, IndexOp, Result, Tensor, D};
use candle_nn::{embedding, linear, linear_no_bias, ops, Embedding, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

fn lerp(start: &Tensor, end: &Tensor, weight: &Tensor) -> Result<Tensor> {
    start.add(&end.sub(start)?.broadcast_mul(weight)?)
}

/// `[batch, len]` with 1.0 inside each sequence and 0.0 on padding.
fn length_mask(lengths: &[usize], len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = lengths
        .iter()
        .flat_map(|&l| (0..len).map(move |t| if t < l { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (lengths.len(), len), device)
}

/// Negative log-likelihood over log-probabilities, skipping `ignore_index` targets.
pub struct NllLoss {
    pub ignore_index: u32,
}

impl NllLoss {
    pub fn new(ignore_index: u32) -> Self {
        Self { ignore_index }
    }

    /// `log_probs` is `[batch, vocab]`, `target` is `[batch]` u32. Mean over kept targets,
    /// zero when every target is ignored.
    pub fn forward(&self, log_probs: &Tensor, target: &Tensor) -> Result<Tensor> {
        let picked = log_probs
            .gather(&target.unsqueeze(1)?.contiguous()?, 1)?
            .squeeze(1)?;
        let keep = target.ne(self.ignore_index)?.to_dtype(log_probs.dtype())?;
        // an all-ignored step has a zero numerator, so clamping the count keeps it at 0
        let kept = keep.sum_all()?.maximum(1.0)?;
        picked.mul(&keep)?.sum_all()?.neg()?.div(&kept)
    }
}

/// GRU cell with PyTorch gate layout (reset, update, new).
struct GruCell {
    input_gates: Linear,
    hidden_gates: Linear,
}

impl GruCell {
    fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let input_gates = linear(in_dim, hidden * 3, vb.pp("input_gates"))?;
        let hidden_gates = linear(hidden, hidden * 3, vb.pp("hidden_gates"))?;
        Ok(Self {
            input_gates,
            hidden_gates,
        })
    }

    fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let xg = self.input_gates.forward(x)?.chunk(3, D::Minus1)?;
        let hg = self.hidden_gates.forward(h)?.chunk(3, D::Minus1)?;
        let reset = ops::sigmoid(&xg[0].add(&hg[0])?)?;
        let update = ops::sigmoid(&xg[1].add(&hg[1])?)?;
        let candidate = xg[2].add(&reset.mul(&hg[2])?)?.tanh()?;
        // h' = (1 - z) * n + z * h
        lerp(&candidate, h, &update)
    }
}

struct Encoder {
    gru: GruCell,
    hidden_size: usize,
}

impl Encoder {
    /// `embedded` is `[src_len, batch, embed]`. Returns outputs `[batch, src_len, hidden]`
    /// (zero on padding) and the final hidden state of each sequence.
    fn forward(&self, embedded: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (src_len, batch, _) = embedded.dims3()?;
        let mut h = Tensor::zeros((batch, self.hidden_size), embedded.dtype(), embedded.device())?;
        let mut outputs = Vec::with_capacity(src_len);
        for t in 0..src_len {
            let step_mask = mask.i((.., t..t + 1))?;
            let next = self.gru.step(&embedded.i(t)?, &h)?;
            // hidden state stays frozen once a sequence has ended
            h = lerp(&h, &next, &step_mask)?;
            outputs.push(next.broadcast_mul(&step_mask)?);
        }
        Ok((Tensor::stack(&outputs, 1)?, h))
    }
}

/// Luong "general" attention.
struct Attention {
    score: Linear,
}

impl Attention {
    /// `query` `[batch, hidden]`, `keys` `[batch, src_len, hidden]`, `mask` `[batch, src_len]`.
    fn forward(&self, query: &Tensor, keys: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let q = self.score.forward(query)?.unsqueeze(2)?;
        let scores = keys.matmul(&q)?.squeeze(2)?;
        // push padded positions to ~-inf before the softmax
        let scores = scores.add(&mask.affine(1e9, -1e9)?)?;
        let weights = ops::softmax(&scores, D::Minus1)?;
        weights.unsqueeze(1)?.matmul(keys)?.squeeze(1)
    }
}

struct Decoder {
    gru: GruCell,
    attention: Attention,
    combine: Linear,
    to_logits: Linear,
}

impl Decoder {
    /// One decoding step. Returns log-probabilities `[batch, vocab]` and the new hidden state.
    fn step(
        &self,
        embedded: &Tensor,
        h: &Tensor,
        enc_out: &Tensor,
        mask: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let h = self.gru.step(embedded, h)?;
        let context = self.attention.forward(&h, enc_out, mask)?;
        let combined = self
            .combine
            .forward(&Tensor::cat(&[&h, &context], D::Minus1)?)?
            .tanh()?;
        let logits = self.to_logits.forward(&combined)?;
        Ok((ops::log_softmax(&logits, D::Minus1)?, h))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Seq2SeqConfig {
    pub vocab_size: usize,
    pub embed_size: usize,
    pub hidden_size: usize,
    pub tgt_len: usize,
}

/// Attentional GRU encoder/decoder over a shared vocabulary.
pub struct Seq2Seq {
    token_emb: Embedding,
    encoder: Encoder,
    decoder: Decoder,
    tgt_len: usize,
}

impl Seq2Seq {
    pub fn new(config: &Seq2SeqConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let token_emb = embedding(config.vocab_size, config.embed_size, vb.pp("embedding"))?;
        let encoder = Encoder {
            gru: GruCell::new(config.embed_size, hidden, vb.pp("encoder"))?,
            hidden_size: hidden,
        };
        let decoder = Decoder {
            gru: GruCell::new(config.embed_size, hidden, vb.pp("decoder"))?,
            attention: Attention {
                score: linear_no_bias(hidden, hidden, vb.pp("decoder.attention"))?,
            },
            combine: linear(hidden * 2, hidden, vb.pp("decoder.combine"))?,
            to_logits: linear(hidden, config.vocab_size, vb.pp("decoder.to_logits"))?,
        };
        Ok(Self {
            token_emb,
            encoder,
            decoder,
            tgt_len: config.tgt_len,
        })
    }

    fn encode(&self, input: &Tensor, input_lengths: &[usize]) -> Result<(Tensor, Tensor, Tensor)> {
        let src_len = input.dim(0)?;
        let mask = length_mask(input_lengths, src_len, input.device())?;
        let embedded = self.token_emb.forward(input)?;
        let (enc_out, h) = self.encoder.forward(&embedded, &mask)?;
        Ok((enc_out, h, mask))
    }

    /// Teacher-forced pass. `input` is `[src_len, batch]`, `target` is `[tgt_len, batch]`.
    /// Returns the per-step criterion summed over target steps.
    pub fn forward(
        &self,
        input: &Tensor,
        target: &Tensor,
        input_lengths: &[usize],
        criterion: &NllLoss,
    ) -> Result<Tensor> {
        let (enc_out, mut h, mask) = self.encode(input, input_lengths)?;
        let (tgt_len, batch) = target.dims2()?;
        let mut prev = Tensor::full(SOS, batch, target.device())?;
        let mut loss = Tensor::zeros((), enc_out.dtype(), enc_out.device())?;
        for t in 0..tgt_len {
            let embedded = self.token_emb.forward(&prev)?;
            let (log_probs, next_h) = self.decoder.step(&embedded, &h, &enc_out, &mask)?;
            h = next_h;
            let step_target = target.i(t)?;
            loss = loss.add(&criterion.forward(&log_probs, &step_target)?)?;
            prev = step_target;
        }
        Ok(loss)
    }

    /// Greedy decoding, one id sequence per batch column. Stops early once every column
    /// has produced EOS. `max_len` of `None` falls back to the longest training summary.
    pub fn greedy_decode(
        &self,
        input: &Tensor,
        input_lengths: &[usize],
        max_len: Option<usize>,
    ) -> Result<Vec<Vec<u32>>> {
        let (enc_out, mut h, mask) = self.encode(input, input_lengths)?;
        let batch = input.dim(1)?;
        let max_len = max_len.unwrap_or(self.tgt_len).max(1);
        let mut prev = Tensor::full(SOS, batch, input.device())?;
        let mut out = vec![Vec::new(); batch];
        let mut finished = vec![false; batch];
        for _ in 0..max_len {
            let embedded = self.token_emb.forward(&prev)?;
            let (log_probs, next_h) = self.decoder.step(&embedded, &h, &enc_out, &mask)?;
            h = next_h;
            prev = log_probs.argmax(D::Minus1)?;
            for (b, id) in prev.to_vec1::<u32>()?.into_iter().enumerate() {
                if !finished[b] {
                    out[b].push(id);
                    finished[b] = id == EOS;
                }
            }
            if finished.iter().all(|&f| f) {
                break;
            }
        }
        Ok(out)
    }
}
