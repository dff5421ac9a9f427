use crate::error::{CtcError, Result};

/// Label entries in coordinate form: one `(batch, position)` pair per label.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseLabels {
    indices: Vec<[i64; 2]>,
    values: Vec<i64>,
}

impl SparseLabels {
    pub fn new(indices: Vec<[i64; 2]>, values: Vec<i64>) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(CtcError::ShapeMismatch {
                what: "label values",
                expected: indices.len(),
                got: values.len(),
            });
        }

        Ok(Self { indices, values })
    }

    /// Build from a row-major `[n, 2]` index buffer.
    pub fn from_flat(flat_indices: &[i64], values: Vec<i64>) -> Result<Self> {
        if flat_indices.len() != 2 * values.len() {
            return Err(CtcError::ShapeMismatch {
                what: "label indices",
                expected: 2 * values.len(),
                got: flat_indices.len(),
            });
        }

        let indices = flat_indices
            .chunks_exact(2)
            .map(|pair| [pair[0], pair[1]])
            .collect();

        Self::new(indices, values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn indices(&self) -> &[[i64; 2]] {
        &self.indices
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    /// Group the entries into one label run per batch element.
    ///
    /// Entries are scanned once in storage order; a change of batch index closes the
    /// current run. Batch elements without any entry get an empty run.
    pub fn group(&self, batch_size: usize) -> Result<LabelBatch> {
        let mut labels = Vec::with_capacity(self.values.len());
        let mut lengths = Vec::with_capacity(batch_size);

        // (batch, last position) of the run being accumulated
        let mut current: Option<(i64, i64)> = None;
        let mut run_length = 0usize;

        for (entry, (&[batch, position], &value)) in
            self.indices.iter().zip(&self.values).enumerate()
        {
            if batch < 0 || batch as usize >= batch_size {
                return Err(CtcError::LabelBatchOutOfRange {
                    entry,
                    batch,
                    batch_size,
                });
            }

            match current {
                Some((previous, _)) if batch < previous => {
                    return Err(CtcError::UnsortedLabels {
                        entry,
                        batch,
                        previous,
                    });
                }
                Some((previous, last_position)) if batch == previous => {
                    if position <= last_position {
                        return Err(CtcError::UnorderedLabelPosition {
                            entry,
                            batch: batch as usize,
                            position,
                            previous: last_position,
                        });
                    }
                    run_length += 1;
                }
                _ => {
                    if current.is_some() {
                        lengths.push(run_length);
                    }
                    // batch elements skipped over have no labels
                    lengths.resize(batch as usize, 0);
                    run_length = 1;
                }
            }

            if value < 0 {
                return Err(CtcError::NegativeLabel {
                    entry,
                    label: value,
                });
            }
            labels.push(value as usize);
            current = Some((batch, position));
        }

        if current.is_some() {
            lengths.push(run_length);
        }
        lengths.resize(batch_size, 0);

        Ok(LabelBatch { labels, lengths })
    }
}

/// Dense label runs: the concatenated labels of every sequence plus their lengths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelBatch {
    labels: Vec<usize>,
    lengths: Vec<usize>,
}

impl LabelBatch {
    pub fn from_dense(targets: Vec<usize>, lengths: Vec<usize>) -> Result<Self> {
        let total: usize = lengths.iter().sum();
        if total != targets.len() {
            return Err(CtcError::ShapeMismatch {
                what: "sum of target lengths",
                expected: targets.len(),
                got: total,
            });
        }

        Ok(Self {
            labels: targets,
            lengths,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Concatenated labels of all sequences.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn runs(&self) -> LabelRuns<'_> {
        LabelRuns {
            labels: &self.labels,
            lengths: self.lengths.iter(),
        }
    }

    pub fn run(&self, batch: usize) -> Option<&[usize]> {
        let length = *self.lengths.get(batch)?;
        let start: usize = self.lengths[..batch].iter().sum();
        Some(&self.labels[start..start + length])
    }

    /// Merge adjacent duplicate labels inside every run.
    pub fn collapse_repeated(&self) -> Self {
        let mut labels = Vec::with_capacity(self.labels.len());
        let mut lengths = Vec::with_capacity(self.lengths.len());

        for run in self.runs() {
            let before = labels.len();
            for (idx, &label) in run.iter().enumerate() {
                if idx == 0 || run[idx - 1] != label {
                    labels.push(label);
                }
            }
            lengths.push(labels.len() - before);
        }

        Self { labels, lengths }
    }

    pub fn to_sparse(&self) -> SparseLabels {
        let mut indices = Vec::with_capacity(self.labels.len());
        let mut values = Vec::with_capacity(self.labels.len());

        for (batch, run) in self.runs().enumerate() {
            for (position, &label) in run.iter().enumerate() {
                indices.push([batch as i64, position as i64]);
                values.push(label as i64);
            }
        }

        SparseLabels { indices, values }
    }
}

/// Iterator over the label run of each sequence.
pub struct LabelRuns<'a> {
    labels: &'a [usize],
    lengths: std::slice::Iter<'a, usize>,
}

impl<'a> Iterator for LabelRuns<'a> {
    type Item = &'a [usize];

    fn next(&mut self) -> Option<Self::Item> {
        let &length = self.lengths.next()?;
        let (run, rest) = self.labels.split_at(length);
        self.labels = rest;
        Some(run)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.lengths.size_hint()
    }
}

impl ExactSizeIterator for LabelRuns<'_> {}
