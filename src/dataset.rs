use std::ops::Range;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{
    converter::Converter,
    engine::required_time,
    utils::tensor_ext::{float_tensor, int_tensor, pad},
};

#[derive(Clone)]
pub struct CtcBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> CtcBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

#[derive(Clone, Debug)]
pub struct CtcBatch<B: Backend> {
    /// `[max_time, batch_size, num_classes]`, zero padded past each sequence length.
    pub activations: Tensor<B, 3>,
    pub labels_indices: Tensor<B, 2, Int>,
    pub labels_values: Tensor<B, 1, Int>,
    pub sequence_length: Tensor<B, 1, Int>,
    pub texts: Vec<String>,
}

impl<B: Backend> Batcher<CtcItem, CtcBatch<B>> for CtcBatcher<B> {
    fn batch(&self, items: Vec<CtcItem>) -> CtcBatch<B> {
        let max_time = items.iter().map(|item| item.time).max().unwrap_or(0);

        let activations = items
            .iter()
            .map(|item| {
                let tensor = float_tensor::<B, 3>(
                    item.activations.clone(),
                    [item.time, 1, item.num_classes],
                    &self.device,
                );
                pad(tensor, [(0, max_time - item.time), (0, 0), (0, 0)], 0.0)
            })
            .collect();
        let activations = Tensor::cat(activations, 1);

        let mut indices = vec![];
        let mut values = vec![];
        for (batch, item) in items.iter().enumerate() {
            for (position, &label) in item.target.iter().enumerate() {
                indices.extend([batch as i64, position as i64]);
                values.push(label as i64);
            }
        }
        let num_labels = values.len();
        let labels_indices = int_tensor::<B, 2>(indices, [num_labels, 2], &self.device);
        let labels_values = int_tensor::<B, 1>(values, [num_labels], &self.device);

        let lengths: Vec<_> = items.iter().map(|item| item.time as i64).collect();
        let sequence_length = int_tensor::<B, 1>(lengths, [items.len()], &self.device);

        CtcBatch {
            activations,
            labels_indices,
            labels_values,
            sequence_length,
            texts: items.into_iter().map(|item| item.text).collect(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CtcItem {
    /// Row-major `[time, num_classes]` scores.
    pub activations: Vec<f32>,
    pub time: usize,
    pub num_classes: usize,
    pub target: Vec<usize>,
    pub text: String,
}

/// Random texts over a lexicon with noisy activations that favour one alignment of
/// the text. Items are reproducible: item `i` is drawn from `seed + i`.
pub struct SyntheticCtcDataset {
    converter: Converter,
    text_length: Range<usize>,
    max_time: usize,
    dataset_size: usize,
    seed: u64,
    noise: f32,
    peak: f32,
}

impl SyntheticCtcDataset {
    pub fn new(
        converter: Converter,
        text_length: Range<usize>,
        max_time: usize,
        dataset_size: usize,
        seed: u64,
    ) -> Self {
        Self {
            converter,
            text_length,
            max_time,
            dataset_size,
            seed,
            noise: 1.0,
            peak: 4.0,
        }
    }

    pub fn with_noise(mut self, noise: f32, peak: f32) -> Self {
        self.noise = noise;
        self.peak = peak;
        self
    }
}

/// Frame-level classes placing each label at an evenly spaced time step, blank elsewhere.
fn alignment(target: &[usize], time: usize) -> Vec<usize> {
    let mut frames = vec![0; time];
    let num_labels = target.len();
    for (idx, &label) in target.iter().enumerate() {
        let t = ((2 * idx + 1) * time) / (2 * num_labels);
        frames[t.min(time - 1)] = label;
    }
    frames
}

impl Dataset<CtcItem> for SyntheticCtcDataset {
    fn get(&self, index: usize) -> Option<CtcItem> {
        if index >= self.dataset_size || self.converter.lexicon.is_empty() {
            return None;
        }

        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let num_chars = rng.gen_range(self.text_length.clone());
        let text: String = (0..num_chars)
            .filter_map(|_| {
                let label = rng.gen_range(1..self.converter.num_classes());
                self.converter.symbol(label)
            })
            .collect();
        let target = self.converter.encode_single(&text).ok()?;

        let required = required_time(&target, true).max(1);
        let time = rng.gen_range(required..=self.max_time.max(required));
        let num_classes = self.converter.num_classes();

        let normal = Normal::new(0.0, self.noise).ok()?;
        let mut activations: Vec<f32> = (0..time * num_classes)
            .map(|_| normal.sample(&mut rng))
            .collect();
        for (t, class) in alignment(&target, time).into_iter().enumerate() {
            activations[t * num_classes + class] += self.peak;
        }

        Some(CtcItem {
            activations,
            time,
            num_classes,
            target,
            text,
        })
    }

    fn len(&self) -> usize {
        self.dataset_size
    }
}
