use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer};

pub const PAD: u32 = 0;
pub const SOS: u32 = 1;
pub const EOS: u32 = 2;
pub const UNK: u32 = 3;

const RESERVED: [&str; 4] = ["<pad>", "<sos>", "<eos>", "<unk>"];

/// Lowercases and splits on whitespace, keeping punctuation runs as their own tokens.
pub fn tokenize(text: &str) -> anyhow::Result<Vec<String>> {
    let lowered = text.to_lowercase();
    let mut pretok = PreTokenizedString::from(lowered.as_str());
    Whitespace {}
        .pre_tokenize(&mut pretok)
        .map_err(|e| anyhow!("pre-tokenization failed: {e}"))?;
    Ok(pretok
        .get_splits(OffsetReferential::Original, OffsetType::Byte)
        .into_iter()
        .map(|(word, _, _)| word.to_owned())
        .collect())
}

/// Word-level vocabulary. Ids are contiguous and the first four are reserved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vocab {
    name: String,
    words: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, u32>,
}

impl Vocab {
    pub fn new(name: &str) -> Self {
        let mut vocab = Self {
            name: name.to_owned(),
            words: Vec::new(),
            index: HashMap::new(),
        };
        for tok in RESERVED {
            vocab.add_word(tok);
        }
        vocab
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn add_word(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.index.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_owned());
        self.index.insert(word.to_owned(), id);
        id
    }

    pub fn add_sentence<S: AsRef<str>>(&mut self, words: &[S]) {
        for w in words {
            self.add_word(w.as_ref());
        }
    }

    pub fn id(&self, word: &str) -> u32 {
        self.index.get(word).copied().unwrap_or(UNK)
    }

    pub fn word(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    pub fn encode<S: AsRef<str>>(&self, words: &[S]) -> Vec<u32> {
        words.iter().map(|w| self.id(w.as_ref())).collect()
    }

    /// Stops at the first EOS; PAD and SOS are dropped.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .take_while(|&&id| id != EOS)
            .filter(|&&id| id != PAD && id != SOS)
            .filter_map(|&id| self.word(id))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The lookup map is not serialized; call this after deserializing.
    pub fn reindex(&mut self) {
        self.index = self
            .words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
    }
}
