use crate::{
    error::{CtcError, Result},
    labels::{LabelBatch, SparseLabels},
};

/// Best-path decoding result for a minibatch.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedBatch {
    pub labels: LabelBatch,
    /// Log probability of the best path of each sequence.
    pub log_probability: Vec<f32>,
}

impl DecodedBatch {
    pub fn to_sparse(&self) -> SparseLabels {
        self.labels.to_sparse()
    }
}

/// Greedy (best path) decoding of time-major activations `[max_time, minibatch, alphabet_size]`.
///
/// The most likely class is taken at each step; blanks are dropped, and with
/// `merge_repeated` consecutive identical classes are emitted once.
pub fn greedy_decode(
    activations: &[f32],
    max_time: usize,
    minibatch: usize,
    alphabet_size: usize,
    input_lengths: &[usize],
    blank: usize,
    merge_repeated: bool,
) -> Result<DecodedBatch> {
    if activations.len() != max_time * minibatch * alphabet_size {
        return Err(CtcError::ShapeMismatch {
            what: "activation elements",
            expected: max_time * minibatch * alphabet_size,
            got: activations.len(),
        });
    }
    if input_lengths.len() != minibatch {
        return Err(CtcError::ShapeMismatch {
            what: "sequence lengths",
            expected: minibatch,
            got: input_lengths.len(),
        });
    }

    let mut labels = Vec::new();
    let mut lengths = Vec::with_capacity(minibatch);
    let mut log_probability = Vec::with_capacity(minibatch);

    for (batch, &time) in input_lengths.iter().enumerate() {
        if time > max_time {
            return Err(CtcError::SequenceLengthOutOfRange {
                batch,
                length: time as i64,
                max_time,
            });
        }

        let before = labels.len();
        let mut previous = None;
        let mut score = 0.0;
        for t in 0..time {
            let start = (t * minibatch + batch) * alphabet_size;
            let row = &activations[start..start + alphabet_size];
            let (class, &best) = row
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .ok_or(CtcError::InvalidAlphabet {
                    blank,
                    alphabet_size,
                })?;
            let normalizer = row
                .iter()
                .map(|&x| (x - best).exp())
                .sum::<f32>()
                .ln();
            score -= normalizer;

            if class != blank && !(merge_repeated && previous == Some(class)) {
                labels.push(class);
            }
            previous = Some(class);
        }
        lengths.push(labels.len() - before);
        log_probability.push(score);
    }

    Ok(DecodedBatch {
        labels: LabelBatch::from_dense(labels, lengths)?,
        log_probability,
    })
}
