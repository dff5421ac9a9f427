use core::marker::PhantomData;
use std::sync::Arc;

use burn::{
    config::Config,
    nn::loss::Reduction,
    tensor::{Int, Tensor},
};

use super::backend::{Backend, WarpCtc, WarpCtcOptions};
use crate::{
    engine::{greedy_decode, CtcOptions, DecodedBatch},
    error::{self, CtcError},
    labels::LabelBatch,
    utils::tensor_ext::{float_tensor, float_values, int_tensor, int_values},
};

#[derive(Config, Debug)]
pub struct WarpCtcLossConfig {
    /// Class index of the blank symbol.
    #[config(default = 0)]
    pub blank: usize,
    /// Merge repeated labels in the targets before computing the loss.
    #[config(default = false)]
    pub preprocess_collapse_repeated: bool,
    /// Whether a label held over several time steps is emitted once.
    #[config(default = true)]
    pub ctc_merge_repeated: bool,
    /// Return a zero loss and gradient for sequences too short for their labels.
    #[config(default = false)]
    pub ignore_longer_outputs_than_inputs: bool,
    /// Worker threads of the engine, `0` for the global pool.
    #[config(default = 0)]
    pub num_threads: usize,
}

impl WarpCtcLossConfig {
    pub fn options(&self) -> WarpCtcOptions {
        WarpCtcOptions {
            preprocess_collapse_repeated: self.preprocess_collapse_repeated,
            engine: CtcOptions {
                blank: self.blank,
                merge_repeated: self.ctc_merge_repeated,
                ignore_longer_outputs_than_inputs: self.ignore_longer_outputs_than_inputs,
                num_threads: self.num_threads,
            },
        }
    }

    /// Builds the engine; fails when its thread pool cannot be created.
    pub fn init<B: Backend>(&self) -> error::Result<WarpCtcLoss<B>> {
        WarpCtcLoss::new(self.options())
    }

    /// Greedy decoder matching this loss configuration.
    pub fn init_decoder(&self) -> CtcGreedyDecoder {
        CtcGreedyDecoder::new(self.blank, self.ctc_merge_repeated)
    }
}

/// Per-sequence loss and activation gradient of one invocation.
#[derive(Clone, Debug)]
pub struct CtcOutput<B: Backend> {
    /// Shape `[batch_size]`.
    pub loss: Tensor<B, 1>,
    /// Shape `[max_time, batch_size, num_classes]`, zero past each sequence length.
    pub gradient: Tensor<B, 3>,
    /// Number of target labels supplied for each sequence.
    pub label_lengths: Vec<usize>,
}

impl<B: Backend> CtcOutput<B> {
    /// None: no reduction; Sum: the losses are summed; Mean/Auto: each loss is divided
    /// by its label length (at least 1) and the mean over the batch is taken.
    pub fn reduce(&self, reduction: Option<Reduction>) -> Tensor<B, 1> {
        match reduction {
            Some(Reduction::Mean) | Some(Reduction::Auto) => {
                let lengths = self
                    .label_lengths
                    .iter()
                    .map(|&length| length.max(1) as f32)
                    .collect();
                let lengths =
                    float_tensor::<B, 1>(lengths, [self.label_lengths.len()], &self.loss.device());
                (self.loss.clone() / lengths).mean()
            }
            Some(Reduction::Sum) => self.loss.clone().sum(),
            None => self.loss.clone(),
        }
    }
}

/// The Connectionist Temporal Classification loss over unnormalized activations.
#[derive(Clone, Debug)]
pub struct WarpCtcLoss<B: Backend> {
    ctc: Arc<WarpCtc>,
    backend: PhantomData<B>,
}

impl<B: Backend> WarpCtcLoss<B> {
    pub fn new(options: WarpCtcOptions) -> error::Result<Self> {
        Ok(Self {
            ctc: Arc::new(WarpCtc::new(options)?),
            backend: PhantomData,
        })
    }

    pub fn options(&self) -> &WarpCtcOptions {
        self.ctc.options()
    }

    /// Compute the loss and gradient from sparse labels.
    ///
    /// # Parameters:
    ///
    /// - activations: Unnormalized scores, time major. Shape:
    ///   `[max_time, batch_size, num_classes]`
    /// - labels_indices: `(batch, position)` of every label, grouped by batch in
    ///   non-decreasing order. Shape: `[num_labels, 2]`
    /// - labels_values: The class index of every label. Shape: `[num_labels]`
    /// - sequence_length: The valid time extent of each sequence. Shape: `[batch_size]`
    pub fn forward(
        &self,
        activations: Tensor<B, 3>,
        labels_indices: Tensor<B, 2, Int>,
        labels_values: Tensor<B, 1, Int>,
        sequence_length: Tensor<B, 1, Int>,
    ) -> error::Result<CtcOutput<B>> {
        let [_, batch_size, _] = activations.dims();
        let label_lengths = count_labels(labels_indices.clone(), batch_size);

        let (loss, gradient) = B::warp_ctc_loss(
            activations.into_primitive(),
            labels_indices.into_primitive(),
            labels_values.into_primitive(),
            sequence_length.into_primitive(),
            &self.ctc,
        )?;

        Ok(CtcOutput {
            loss: Tensor::from_primitive(loss),
            gradient: Tensor::from_primitive(gradient),
            label_lengths,
        })
    }

    /// Compute the loss and gradient from concatenated targets.
    ///
    /// - targets: The target sequences one after the other. Shape: `[target_lengths_sum]`
    /// - target_lengths: Number of targets of each sequence. Shape: `[batch_size]`
    pub fn forward_dense(
        &self,
        activations: Tensor<B, 3>,
        targets: Tensor<B, 1, Int>,
        target_lengths: Tensor<B, 1, Int>,
        sequence_length: Tensor<B, 1, Int>,
    ) -> error::Result<CtcOutput<B>> {
        let device = activations.device();
        let [_, batch_size, _] = activations.dims();

        let targets = to_labels(int_values(targets))?;
        let lengths = to_lengths(int_values(target_lengths))?;
        if lengths.len() != batch_size {
            return Err(CtcError::ShapeMismatch {
                what: "target lengths",
                expected: batch_size,
                got: lengths.len(),
            });
        }

        let sparse = LabelBatch::from_dense(targets, lengths)?.to_sparse();
        let num_labels = sparse.len();
        let indices = sparse.indices().iter().flatten().copied().collect();
        let labels_indices = int_tensor::<B, 2>(indices, [num_labels, 2], &device);
        let labels_values = int_tensor::<B, 1>(sparse.values().to_vec(), [num_labels], &device);

        self.forward(activations, labels_indices, labels_values, sequence_length)
    }
}

fn count_labels<B: Backend>(labels_indices: Tensor<B, 2, Int>, batch_size: usize) -> Vec<usize> {
    let mut counts = vec![0; batch_size];
    for pair in int_values(labels_indices).chunks_exact(2) {
        if let Some(count) = usize::try_from(pair[0]).ok().and_then(|b| counts.get_mut(b)) {
            *count += 1;
        }
    }
    counts
}

fn to_labels(values: Vec<i64>) -> error::Result<Vec<usize>> {
    values
        .into_iter()
        .enumerate()
        .map(|(entry, label)| {
            usize::try_from(label).map_err(|_| CtcError::NegativeLabel { entry, label })
        })
        .collect()
}

fn to_lengths(values: Vec<i64>) -> error::Result<Vec<usize>> {
    values
        .into_iter()
        .enumerate()
        .map(|(batch, length)| {
            usize::try_from(length).map_err(|_| CtcError::NegativeTargetLength { batch, length })
        })
        .collect()
}

/// Best path decoding of activations.
#[derive(Clone, Debug)]
pub struct CtcGreedyDecoder {
    blank: usize,
    merge_repeated: bool,
}

impl CtcGreedyDecoder {
    pub fn new(blank: usize, merge_repeated: bool) -> Self {
        Self {
            blank,
            merge_repeated,
        }
    }

    /// # Shapes
    ///   - activations `[max_time, batch_size, num_classes]`
    ///   - sequence_length `[batch_size]`
    pub fn decode<B: burn::tensor::backend::Backend>(
        &self,
        activations: Tensor<B, 3>,
        sequence_length: Tensor<B, 1, Int>,
    ) -> error::Result<DecodedBatch> {
        let [max_time, batch_size, num_classes] = activations.dims();
        let lengths = int_values(sequence_length)
            .into_iter()
            .enumerate()
            .map(|(batch, length)| {
                usize::try_from(length).map_err(|_| CtcError::SequenceLengthOutOfRange {
                    batch,
                    length,
                    max_time,
                })
            })
            .collect::<error::Result<Vec<_>>>()?;

        greedy_decode(
            &float_values(activations),
            max_time,
            batch_size,
            num_classes,
            &lengths,
            self.blank,
            self.merge_repeated,
        )
    }
}
