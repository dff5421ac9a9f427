use std::{fs, time::Instant};

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    nn::loss::Reduction,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use tracing::{debug, info};

use crate::{
    burn_ext::backend::Backend,
    converter::Converter,
    dataset::{CtcBatcher, SyntheticCtcDataset},
    parse_config::CtcJobConfig,
};

/// Totals of one pass over the synthetic dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub batches: usize,
    pub sequences: usize,
    /// Mean over batches of the label-length normalized loss.
    pub mean_loss: f32,
    /// Sequences whose greedy decoding equals the target text.
    pub exact_matches: usize,
    /// Largest difference between the autodiff gradient and the returned gradient.
    pub max_gradient_deviation: f32,
}

pub fn run<B: AutodiffBackend + Backend>(
    device: B::Device,
    config: &CtcJobConfig,
) -> Result<RunSummary> {
    let start = Instant::now();

    if config.random_seed != 0 {
        B::seed(config.random_seed);
    }

    let lexicon = fs::read_to_string(&config.lexicon_path)
        .with_context(|| format!("lexicon {} does not exist", config.lexicon_path))?;
    let converter = Converter::new(&lexicon);
    anyhow::ensure!(
        converter.num_classes() > 1,
        "lexicon {} is empty",
        config.lexicon_path
    );

    let loss = config.loss.init::<B>()?;
    let decoder = config.loss.init_decoder();

    let dataset = SyntheticCtcDataset::new(
        converter.clone(),
        config.text_length.clone(),
        config.max_time,
        config.dataset_size,
        config.random_seed,
    )
    .with_noise(config.noise, config.peak);

    let dataloader = DataLoaderBuilder::new(CtcBatcher::<B>::new(device))
        .batch_size(config.batch_size)
        .shuffle(config.random_seed)
        .num_workers(config.num_workers)
        .build(dataset);

    info!(
        num_classes = converter.num_classes(),
        elapsed = start.elapsed().as_secs_f64(),
        "loading completed"
    );

    let mut summary = RunSummary::default();
    let mut loss_total = 0.0;

    for (iteration, batch) in dataloader.iter().enumerate() {
        let activations = batch.activations.require_grad();
        let output = loss
            .forward(
                activations.clone(),
                batch.labels_indices,
                batch.labels_values,
                batch.sequence_length.clone(),
            )
            .with_context(|| format!("iteration {iteration}"))?;

        let batch_loss = output
            .reduce(Some(Reduction::Mean))
            .into_scalar()
            .elem::<f32>();

        // Summed losses give every sequence an upstream gradient of one, so the
        // autodiff gradient must equal the one the engine handed back.
        let grads = output.loss.clone().sum().backward();
        let deviation = match activations.grad(&grads) {
            Some(grad) => (grad - output.gradient.inner())
                .abs()
                .max()
                .into_scalar()
                .elem::<f32>(),
            None => 0.0,
        };

        let decoded = decoder
            .decode(activations.inner(), batch.sequence_length.inner())
            .with_context(|| format!("iteration {iteration}"))?;
        let texts = converter.decode(&decoded.labels);
        let matches = texts
            .iter()
            .zip(&batch.texts)
            .filter(|(decoded, target)| decoded == target)
            .count();

        if let (Some(decoded), Some(target)) = (texts.first(), batch.texts.first()) {
            debug!(iteration, %decoded, %target, "greedy decoding");
        }
        info!(
            iteration,
            loss = batch_loss,
            matches,
            batch_size = batch.texts.len(),
            gradient_deviation = deviation,
            "[CTC - Iteration {iteration}]"
        );

        summary.batches += 1;
        summary.sequences += batch.texts.len();
        summary.exact_matches += matches;
        summary.max_gradient_deviation = summary.max_gradient_deviation.max(deviation);
        loss_total += batch_loss;
    }

    if summary.batches > 0 {
        summary.mean_loss = loss_total / summary.batches as f32;
    }

    info!(
        batches = summary.batches,
        sequences = summary.sequences,
        mean_loss = summary.mean_loss,
        exact_matches = summary.exact_matches,
        elapsed = start.elapsed().as_secs_f64(),
        "run finished"
    );

    Ok(summary)
}
