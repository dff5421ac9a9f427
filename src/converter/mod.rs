use indexmap::IndexMap;

use crate::{
    error::{CtcError, Result},
    labels::LabelBatch,
};

// Converter maps text to label ids and back; id 0 is left for the blank symbol.
#[derive(Debug, Clone)]
pub struct Converter {
    pub lexicon: IndexMap<char, usize>,
}

impl Converter {
    /// Every distinct character of `raw` becomes one class, line breaks excluded.
    pub fn new(raw: &str) -> Self {
        let mut lexicon = IndexMap::with_capacity(raw.len());

        for ch in raw.chars().filter(|ch| !matches!(ch, '\n' | '\r')) {
            let next = lexicon.len() + 1;
            lexicon.entry(ch).or_insert(next);
        }

        Converter { lexicon }
    }

    /// Number of classes including the blank.
    pub fn num_classes(&self) -> usize {
        self.lexicon.len() + 1
    }

    pub fn symbol(&self, label: usize) -> Option<char> {
        let (&ch, _) = self.lexicon.get_index(label.checked_sub(1)?)?;
        Some(ch)
    }

    pub fn encode_single<S: AsRef<str>>(&self, text: S) -> Result<Vec<usize>> {
        text.as_ref()
            .chars()
            .map(|ch| {
                self.lexicon
                    .get(&ch)
                    .copied()
                    .ok_or(CtcError::UnknownSymbol { symbol: ch })
            })
            .collect()
    }

    pub fn encode_multi<S: AsRef<str>>(&self, texts: &[S]) -> Result<LabelBatch> {
        let mut labels = vec![];
        let mut lengths = Vec::with_capacity(texts.len());

        for text in texts {
            let encoded = self.encode_single(text)?;
            lengths.push(encoded.len());
            labels.extend(encoded);
        }

        LabelBatch::from_dense(labels, lengths)
    }

    /// Text of every label run.
    pub fn decode(&self, labels: &LabelBatch) -> Vec<String> {
        labels
            .runs()
            .map(|run| run.iter().filter_map(|&label| self.symbol(label)).collect())
            .collect()
    }

    /// Render a frame-level alignment, `-` standing for the blank.
    pub fn decode_alignment(&self, alignment: &[usize]) -> String {
        alignment
            .iter()
            .map(|&label| self.symbol(label).unwrap_or('-'))
            .collect()
    }
}
