use std::{fs, ops::Range, path::Path};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::burn_ext::ctc::WarpCtcLossConfig;

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct LossYaml {
    blank: usize,
    preprocess_collapse_repeated: bool,
    ctc_merge_repeated: bool,
    ignore_longer_outputs_than_inputs: bool,
    num_threads: usize,
}

impl Default for LossYaml {
    fn default() -> Self {
        Self {
            blank: 0,
            preprocess_collapse_repeated: false,
            ctc_merge_repeated: true,
            ignore_longer_outputs_than_inputs: false,
            num_threads: 0,
        }
    }
}

fn default_noise() -> f32 {
    1.0
}

fn default_peak() -> f32 {
    4.0
}

#[derive(Serialize, Deserialize, Debug)]
struct JobYaml {
    lexicon_path: String,
    batch_size: usize,
    num_workers: usize,
    dataset_size: usize,
    text_length: [usize; 2],
    max_time: usize,
    random_seed: u64,
    #[serde(default = "default_noise")]
    noise: f32,
    #[serde(default = "default_peak")]
    peak: f32,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "UPPERCASE")]
struct CtcJobConfigYaml {
    #[serde(default)]
    loss: LossYaml,
    job: JobYaml,
}

#[derive(Debug)]
pub struct CtcJobConfig {
    pub loss: WarpCtcLossConfig,
    pub lexicon_path: String,
    pub batch_size: usize,
    pub num_workers: usize,
    pub dataset_size: usize,
    pub text_length: Range<usize>,
    pub max_time: usize,
    pub random_seed: u64,
    pub noise: f32,
    pub peak: f32,
}

impl CtcJobConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("job config {} does not exist", path.display()))?;

        Self::from_yaml_str(&raw).with_context(|| format!("fail to read job config {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let yaml: CtcJobConfigYaml = serde_yaml::from_str(raw)?;
        let [min_length, max_length] = yaml.job.text_length;

        ensure!(yaml.job.batch_size > 0, "batch_size must be positive");
        ensure!(
            min_length < max_length,
            "text_length [{min_length}, {max_length}] is an empty range"
        );
        ensure!(yaml.job.noise > 0.0, "noise must be positive");

        let loss = WarpCtcLossConfig::new()
            .with_blank(yaml.loss.blank)
            .with_preprocess_collapse_repeated(yaml.loss.preprocess_collapse_repeated)
            .with_ctc_merge_repeated(yaml.loss.ctc_merge_repeated)
            .with_ignore_longer_outputs_than_inputs(yaml.loss.ignore_longer_outputs_than_inputs)
            .with_num_threads(yaml.loss.num_threads);

        Ok(Self {
            loss,
            lexicon_path: yaml.job.lexicon_path,
            batch_size: yaml.job.batch_size,
            num_workers: yaml.job.num_workers,
            dataset_size: yaml.job.dataset_size,
            text_length: min_length..max_length,
            max_time: yaml.job.max_time,
            random_seed: yaml.job.random_seed,
            noise: yaml.job.noise,
            peak: yaml.job.peak,
        })
    }
}
