//! Host-side CTC loss engine.
//!
//! The calling pattern is fixed: [`CtcEngine::workspace_size`], then
//! [`Workspace::allocate`], then [`CtcEngine::compute`]. The workspace is released
//! when it goes out of scope.

mod cpu;
mod decode;
mod workspace;

use core::mem::size_of;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use decode::{greedy_decode, DecodedBatch};
pub use workspace::Workspace;

use crate::{
    error::{CtcError, Result},
    labels::LabelBatch,
};

use cpu::{Activations, Sequence};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtcOptions {
    /// Class index reserved for the blank symbol.
    pub blank: usize,
    /// Whether a label held over several time steps is emitted once.
    pub merge_repeated: bool,
    /// Give sequences whose labels cannot fit a zero loss and gradient instead of failing.
    pub ignore_longer_outputs_than_inputs: bool,
    /// Worker threads; `0` runs on the global rayon pool.
    pub num_threads: usize,
}

impl Default for CtcOptions {
    fn default() -> Self {
        Self {
            blank: 0,
            merge_repeated: true,
            ignore_longer_outputs_than_inputs: false,
            num_threads: 0,
        }
    }
}

/// Minimum number of time steps needed to emit `labels`.
///
/// When repeats are merged, two equal neighbours need a blank in between.
pub fn required_time(labels: &[usize], merge_repeated: bool) -> usize {
    let repeats = if merge_repeated {
        labels.windows(2).filter(|pair| pair[0] == pair[1]).count()
    } else {
        0
    };

    labels.len() + repeats
}

/// Borrowed inputs of one loss invocation.
#[derive(Clone, Copy, Debug)]
pub struct CtcProblem<'a> {
    /// Time-major activations `[max_time, minibatch, alphabet_size]`.
    pub activations: &'a [f32],
    pub max_time: usize,
    pub minibatch: usize,
    pub alphabet_size: usize,
    pub labels: &'a LabelBatch,
    pub input_lengths: &'a [usize],
}

impl CtcProblem<'_> {
    /// Check every precondition of the engine.
    ///
    /// Returns, per sequence, whether it is computed. A `false` entry only appears
    /// when `ignore_longer_outputs_than_inputs` is set.
    pub fn validate(&self, options: &CtcOptions) -> Result<Vec<bool>> {
        if self.alphabet_size == 0 || options.blank >= self.alphabet_size {
            return Err(CtcError::InvalidAlphabet {
                blank: options.blank,
                alphabet_size: self.alphabet_size,
            });
        }
        let elements = self
            .max_time
            .checked_mul(self.minibatch)
            .and_then(|n| n.checked_mul(self.alphabet_size))
            .ok_or(CtcError::ShapeMismatch {
                what: "activation elements",
                expected: usize::MAX,
                got: self.activations.len(),
            })?;
        if self.activations.len() != elements {
            return Err(CtcError::ShapeMismatch {
                what: "activation elements",
                expected: elements,
                got: self.activations.len(),
            });
        }
        if self.input_lengths.len() != self.minibatch {
            return Err(CtcError::ShapeMismatch {
                what: "sequence lengths",
                expected: self.minibatch,
                got: self.input_lengths.len(),
            });
        }
        if self.labels.batch_size() != self.minibatch {
            return Err(CtcError::ShapeMismatch {
                what: "label batch size",
                expected: self.minibatch,
                got: self.labels.batch_size(),
            });
        }

        let mut computed = Vec::with_capacity(self.minibatch);
        for (batch, (run, &length)) in self.labels.runs().zip(self.input_lengths).enumerate() {
            if length > self.max_time {
                return Err(CtcError::SequenceLengthOutOfRange {
                    batch,
                    length: length as i64,
                    max_time: self.max_time,
                });
            }
            for &label in run {
                if label >= self.alphabet_size {
                    return Err(CtcError::LabelOutOfRange {
                        batch,
                        label: label as i64,
                        alphabet_size: self.alphabet_size,
                    });
                }
                if label == options.blank {
                    return Err(CtcError::BlankLabel {
                        batch,
                        blank: options.blank,
                    });
                }
            }

            let required = required_time(run, options.merge_repeated);
            if required > length {
                if !options.ignore_longer_outputs_than_inputs {
                    return Err(CtcError::LabelsTooLong {
                        batch,
                        label_length: run.len(),
                        required_time: required,
                        sequence_length: length,
                    });
                }
                warn!(
                    batch,
                    label_length = run.len(),
                    sequence_length = length,
                    "labels longer than the sequence, ignoring it"
                );
                computed.push(false);
            } else {
                computed.push(true);
            }
        }

        Ok(computed)
    }
}

/// Computes CTC losses and gradients.
#[derive(Debug)]
pub struct CtcEngine {
    options: CtcOptions,
    pool: Option<rayon::ThreadPool>,
}

impl CtcEngine {
    pub fn new(options: CtcOptions) -> Result<Self> {
        let pool = match options.num_threads {
            0 => None,
            num_threads => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .thread_name(|idx| format!("ctc-worker-{idx}"))
                    .build()?,
            ),
        };

        Ok(Self { options, pool })
    }

    pub fn options(&self) -> &CtcOptions {
        &self.options
    }

    /// Bytes of scratch memory [`CtcEngine::compute`] needs for this batch shape.
    pub fn workspace_size(
        &self,
        label_lengths: &[usize],
        input_lengths: &[usize],
        alphabet_size: usize,
        minibatch: usize,
    ) -> Result<usize> {
        if alphabet_size == 0 {
            return Err(CtcError::WorkspaceSize {
                reason: "alphabet is empty".to_string(),
            });
        }
        if label_lengths.len() != minibatch || input_lengths.len() != minibatch {
            return Err(CtcError::WorkspaceSize {
                reason: format!(
                    "minibatch of {minibatch} with {} label lengths and {} sequence lengths",
                    label_lengths.len(),
                    input_lengths.len()
                ),
            });
        }

        let slots = label_lengths
            .iter()
            .zip(input_lengths)
            .try_fold(0usize, |acc, (&labels, &time)| {
                acc.checked_add(cpu::sequence_slots(time, labels, alphabet_size)?)
            })
            .and_then(|slots| slots.checked_mul(size_of::<f32>()))
            .ok_or_else(|| CtcError::WorkspaceSize {
                reason: "workspace size overflows".to_string(),
            })?;

        Ok(slots)
    }

    /// Compute one cost per sequence and, when `gradients` is given, the gradient with
    /// respect to the activations (same layout as the activations).
    ///
    /// Gradients of time steps past a sequence's length are zero. On error the
    /// gradient buffer is left zeroed.
    pub fn compute(
        &self,
        problem: &CtcProblem,
        workspace: &mut Workspace,
        costs: &mut [f32],
        mut gradients: Option<&mut [f32]>,
    ) -> Result<()> {
        let computed = problem.validate(&self.options)?;

        if costs.len() != problem.minibatch {
            return Err(CtcError::ShapeMismatch {
                what: "costs",
                expected: problem.minibatch,
                got: costs.len(),
            });
        }
        if let Some(gradients) = gradients.as_deref_mut() {
            if gradients.len() != problem.activations.len() {
                return Err(CtcError::ShapeMismatch {
                    what: "gradient elements",
                    expected: problem.activations.len(),
                    got: gradients.len(),
                });
            }
            gradients.fill(0.0);
        }

        let required = self.workspace_size(
            problem.labels.lengths(),
            problem.input_lengths,
            problem.alphabet_size,
            problem.minibatch,
        )?;
        if workspace.size_in_bytes() < required {
            return Err(CtcError::WorkspaceTooSmall {
                required,
                provided: workspace.size_in_bytes(),
            });
        }

        // one disjoint slice of the workspace per sequence
        let mut chunks = Vec::with_capacity(problem.minibatch);
        let mut rest = workspace.as_mut_slice();
        for (&labels, &time) in problem.labels.lengths().iter().zip(problem.input_lengths) {
            // the total was checked for overflow above
            let slots = cpu::sequence_slots(time, labels, problem.alphabet_size).unwrap_or(0);
            let (chunk, tail) = core::mem::take(&mut rest).split_at_mut(slots);
            chunks.push(chunk);
            rest = tail;
        }

        let activations = Activations {
            data: problem.activations,
            minibatch: problem.minibatch,
            alphabet_size: problem.alphabet_size,
        };
        let sequences: Vec<_> = problem
            .labels
            .runs()
            .zip(problem.input_lengths)
            .enumerate()
            .map(|(batch, (labels, &time))| Sequence {
                batch,
                labels,
                time,
            })
            .collect();
        let with_gradient = gradients.is_some();
        let blank = self.options.blank;
        let merge_repeated = self.options.merge_repeated;

        let mut run = || {
            chunks
                .par_iter_mut()
                .zip(&sequences)
                .zip(&computed)
                .map(|((chunk, sequence), &active)| {
                    if !active {
                        return Ok(0.0);
                    }
                    cpu::compute_sequence(
                        &activations,
                        sequence,
                        blank,
                        merge_repeated,
                        chunk,
                        with_gradient,
                    )
                })
                .collect::<Result<Vec<f32>>>()
        };
        let losses = match &self.pool {
            Some(pool) => pool.install(run)?,
            None => run()?,
        };

        costs.copy_from_slice(&losses);

        if let Some(gradients) = gradients {
            let alphabet_size = problem.alphabet_size;
            for ((chunk, sequence), &active) in chunks.iter().zip(&sequences).zip(&computed) {
                if !active {
                    continue;
                }
                for t in 0..sequence.time {
                    let dst = (t * problem.minibatch + sequence.batch) * alphabet_size;
                    gradients[dst..dst + alphabet_size]
                        .copy_from_slice(&chunk[t * alphabet_size..(t + 1) * alphabet_size]);
                }
            }
        }

        debug!(
            minibatch = problem.minibatch,
            workspace_bytes = required,
            "computed ctc loss"
        );

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    fn problem<'a>(
        activations: &'a [f32],
        max_time: usize,
        alphabet_size: usize,
        labels: &'a LabelBatch,
        input_lengths: &'a [usize],
    ) -> CtcProblem<'a> {
        CtcProblem {
            activations,
            max_time,
            minibatch: input_lengths.len(),
            alphabet_size,
            labels,
            input_lengths,
        }
    }

    fn compute(
        engine: &CtcEngine,
        problem: &CtcProblem,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let bytes = engine.workspace_size(
            problem.labels.lengths(),
            problem.input_lengths,
            problem.alphabet_size,
            problem.minibatch,
        )?;
        let mut workspace = Workspace::allocate(bytes)?;
        let mut costs = vec![0.0; problem.minibatch];
        let mut gradients = vec![f32::NAN; problem.activations.len()];
        engine.compute(problem, &mut workspace, &mut costs, Some(gradients.as_mut_slice()))?;
        Ok((costs, gradients))
    }

    fn activations(max_time: usize, minibatch: usize, alphabet_size: usize) -> Vec<f32> {
        (0..max_time * minibatch * alphabet_size)
            .map(|i| ((i * 13 % 17) as f32 - 8.0) / 5.0)
            .collect()
    }

    #[test]
    fn test_required_time() {
        assert_eq!(required_time(&[], true), 0);
        assert_eq!(required_time(&[1, 1, 2, 2, 2], true), 8);
        assert_eq!(required_time(&[1, 1, 2, 2, 2], false), 5);
    }

    #[test]
    fn test_single_label_example() {
        let engine = CtcEngine::new(CtcOptions::default()).unwrap();
        let labels = LabelBatch::from_dense(vec![1], vec![1]).unwrap();
        let data = [0.2, -0.4, 1.0, 0.3, 0.1, -0.6];
        let (costs, gradients) = compute(&engine, &problem(&data, 2, 3, &labels, &[2])).unwrap();

        assert!(costs[0].is_finite() && costs[0] > 0.0);
        assert_eq!(gradients.len(), 6);
        assert!(gradients.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_padding_has_zero_gradient() {
        let engine = CtcEngine::new(CtcOptions::default()).unwrap();
        let labels = LabelBatch::from_dense(vec![1, 2, 3, 3], vec![2, 1, 1]).unwrap();
        let data = activations(6, 3, 4);
        let lengths = [6, 3, 1];
        let (costs, gradients) = compute(&engine, &problem(&data, 6, 4, &labels, &lengths)).unwrap();

        assert!(costs.iter().all(|c| c.is_finite() && *c >= 0.0));
        for t in 0..6 {
            for (batch, &length) in lengths.iter().enumerate() {
                let start = (t * 3 + batch) * 4;
                let row = &gradients[start..start + 4];
                if t >= length {
                    assert!(row.iter().all(|&g| g == 0.0));
                } else {
                    assert!(row.iter().any(|&g| g != 0.0));
                }
            }
        }
    }

    #[test]
    fn test_batch_permutation() {
        let engine = CtcEngine::new(CtcOptions {
            num_threads: 2,
            ..Default::default()
        })
        .unwrap();
        let (max_time, alphabet_size) = (5, 4);
        let data = activations(max_time, 2, alphabet_size);
        let labels = LabelBatch::from_dense(vec![1, 2, 3], vec![2, 1]).unwrap();
        let (costs, _) =
            compute(&engine, &problem(&data, max_time, alphabet_size, &labels, &[5, 3])).unwrap();

        // swap the two sequences
        let mut swapped = data.clone();
        for t in 0..max_time {
            let a = t * 2 * alphabet_size;
            let b = a + alphabet_size;
            for c in 0..alphabet_size {
                swapped.swap(a + c, b + c);
            }
        }
        let labels = LabelBatch::from_dense(vec![3, 1, 2], vec![1, 2]).unwrap();
        let (swapped_costs, _) = compute(
            &engine,
            &problem(&swapped, max_time, alphabet_size, &labels, &[3, 5]),
        )
        .unwrap();

        assert!((costs[0] - swapped_costs[1]).abs() < 1e-5);
        assert!((costs[1] - swapped_costs[0]).abs() < 1e-5);
    }

    #[test]
    fn test_merge_repeated_changes_loss() {
        let labels = LabelBatch::from_dense(vec![1], vec![1]).unwrap();
        let data = [0.0; 6];

        let merged = CtcEngine::new(CtcOptions::default()).unwrap();
        let (merged, _) = compute(&merged, &problem(&data, 2, 3, &labels, &[2])).unwrap();
        let unmerged = CtcEngine::new(CtcOptions {
            merge_repeated: false,
            ..Default::default()
        })
        .unwrap();
        let (unmerged, _) = compute(&unmerged, &problem(&data, 2, 3, &labels, &[2])).unwrap();

        assert!(merged[0] < unmerged[0]);
    }

    #[test]
    fn test_labels_too_long() {
        let engine = CtcEngine::new(CtcOptions::default()).unwrap();
        let labels = LabelBatch::from_dense(vec![1, 1], vec![2]).unwrap();
        let data = activations(2, 1, 3);
        let err = compute(&engine, &problem(&data, 2, 3, &labels, &[2])).unwrap_err();

        assert!(matches!(
            err,
            CtcError::LabelsTooLong {
                batch: 0,
                label_length: 2,
                required_time: 3,
                sequence_length: 2
            }
        ));
    }

    #[test]
    fn test_ignore_longer_outputs_than_inputs() {
        let engine = CtcEngine::new(CtcOptions {
            ignore_longer_outputs_than_inputs: true,
            ..Default::default()
        })
        .unwrap();
        let labels = LabelBatch::from_dense(vec![1, 2, 3, 2], vec![3, 1]).unwrap();
        let data = activations(3, 2, 4);
        let (costs, gradients) = compute(&engine, &problem(&data, 3, 4, &labels, &[2, 3])).unwrap();

        assert_eq!(costs[0], 0.0);
        assert!(costs[1] > 0.0);
        for t in 0..3 {
            let start = t * 2 * 4;
            assert!(gradients[start..start + 4].iter().all(|&g| g == 0.0));
        }
    }

    #[test]
    fn test_rejects_invalid_labels() {
        let engine = CtcEngine::new(CtcOptions::default()).unwrap();
        let data = activations(2, 1, 3);

        let blank = LabelBatch::from_dense(vec![0], vec![1]).unwrap();
        assert!(matches!(
            compute(&engine, &problem(&data, 2, 3, &blank, &[2])),
            Err(CtcError::BlankLabel { .. })
        ));

        let outside = LabelBatch::from_dense(vec![3], vec![1]).unwrap();
        assert!(matches!(
            compute(&engine, &problem(&data, 2, 3, &outside, &[2])),
            Err(CtcError::LabelOutOfRange { label: 3, .. })
        ));

        let labels = LabelBatch::from_dense(vec![1], vec![1]).unwrap();
        assert!(matches!(
            compute(&engine, &problem(&data, 2, 3, &labels, &[3])),
            Err(CtcError::SequenceLengthOutOfRange { .. })
        ));
    }

    #[test]
    fn test_rejects_overflowing_shape() {
        let data = activations(2, 1, 3);
        let labels = LabelBatch::from_dense(vec![1], vec![1]).unwrap();
        let problem = CtcProblem {
            activations: &data,
            max_time: usize::MAX / 2,
            minibatch: 1,
            alphabet_size: 3,
            labels: &labels,
            input_lengths: &[2],
        };

        let err = problem.validate(&CtcOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CtcError::ShapeMismatch {
                what: "activation elements",
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_workspace_errors() {
        let engine = CtcEngine::new(CtcOptions::default()).unwrap();
        assert!(matches!(
            engine.workspace_size(&[1], &[2, 3], 3, 2),
            Err(CtcError::WorkspaceSize { .. })
        ));
        assert!(matches!(
            engine.workspace_size(&[1], &[2], 0, 1),
            Err(CtcError::WorkspaceSize { .. })
        ));
        assert!(matches!(
            engine.workspace_size(&[usize::MAX], &[2], 3, 1),
            Err(CtcError::WorkspaceSize { .. })
        ));

        let labels = LabelBatch::from_dense(vec![1], vec![1]).unwrap();
        let data = activations(2, 1, 3);
        let mut workspace = Workspace::allocate(4).unwrap();
        let mut costs = [0.0];
        let err = engine
            .compute(&problem(&data, 2, 3, &labels, &[2]), &mut workspace, &mut costs, None)
            .unwrap_err();
        assert!(matches!(err, CtcError::WorkspaceTooSmall { .. }));
    }

    #[test]
    fn test_loss_without_gradient() {
        let engine = CtcEngine::new(CtcOptions::default()).unwrap();
        let labels = LabelBatch::from_dense(vec![2, 1], vec![2]).unwrap();
        let data = activations(4, 1, 3);
        let problem = problem(&data, 4, 3, &labels, &[4]);
        let (with_gradient, _) = compute(&engine, &problem).unwrap();

        let bytes = engine.workspace_size(&[2], &[4], 3, 1).unwrap();
        let mut workspace = Workspace::allocate(bytes).unwrap();
        let mut costs = [0.0];
        engine.compute(&problem, &mut workspace, &mut costs, None).unwrap();
        assert!((costs[0] - with_gradient[0]).abs() < 1e-6);
    }
}
