//! # Training Configuration
//!
//! Typed view of the `[CFG]` table in `config.toml`. The file is read once
//! at startup, validated, and then passed around by reference.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::align::BoundaryPolicy;
use crate::error::{NerError, Result};
use crate::labels::NerLabel;

/// When evaluation or checkpointing happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStrategy {
    /// Never.
    No,
    /// Every N optimizer steps.
    Steps,
    /// At the end of every epoch.
    Epoch,
}

/// Metric used to pick the best checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BestMetric {
    F1,
    Precision,
    Recall,
    Accuracy,
    Loss,
}

impl BestMetric {
    /// Whether a larger value is an improvement.
    pub fn greater_is_better(&self) -> bool {
        !matches!(self, BestMetric::Loss)
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "CFG")]
    cfg: TrainConfig,
}

/// All settings for one fine-tuning run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    /// Hugging Face Hub dataset repository, e.g. `klue`.
    pub dset_name: String,
    /// Dataset subset, e.g. `ner`.
    pub task: String,
    /// Pretrained model repository, e.g. `klue/bert-base`.
    #[serde(rename = "PLM")]
    pub plm: String,
    pub max_token_length: usize,
    pub num_labels: usize,
    #[serde(rename = "DEBUG")]
    pub debug: bool,
    pub seed: u64,

    pub num_epochs: usize,
    pub train_batch_size: usize,
    pub valid_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub warmup_ratio: f64,
    pub fp16: bool,

    pub evaluation_strategy: IntervalStrategy,
    pub save_strategy: IntervalStrategy,
    pub save_steps: usize,
    pub eval_steps: usize,
    pub logging_steps: usize,
    /// Maximum number of checkpoints kept on disk.
    pub num_checkpoints: usize,
    pub load_best_model_at_end: bool,
    pub metric_for_best_model: BestMetric,

    #[serde(default)]
    pub boundary_policy: BoundaryPolicy,
    #[serde(default)]
    pub train_file: Option<String>,
    #[serde(default)]
    pub validation_file: Option<String>,
    /// Local directory searched for split files before the Hub.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_revision")]
    pub dataset_revision: String,
}

fn default_revision() -> String {
    "main".to_string()
}

impl TrainConfig {
    /// Read and validate a config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| NerError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate config text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| NerError::Config(e.to_string()))?;
        file.cfg.validate()?;
        Ok(file.cfg)
    }

    /// Reject values the trainer cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(NerError::Config(msg));

        if self.num_labels != NerLabel::NUM_LABELS {
            return fail(format!(
                "num_labels is {} but the label vocabulary has {}",
                self.num_labels,
                NerLabel::NUM_LABELS
            ));
        }
        if !(2..=512).contains(&self.max_token_length) {
            return fail(format!(
                "max_token_length must be in 2..=512, got {}",
                self.max_token_length
            ));
        }
        for (name, value) in [
            ("num_epochs", self.num_epochs),
            ("train_batch_size", self.train_batch_size),
            ("valid_batch_size", self.valid_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("logging_steps", self.logging_steps),
        ] {
            if value == 0 {
                return fail(format!("{} must be positive", name));
            }
        }
        if !(self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(self.weight_decay >= 0.0) {
            return fail(format!("weight_decay must be >= 0, got {}", self.weight_decay));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return fail(format!("warmup_ratio must be in [0, 1], got {}", self.warmup_ratio));
        }
        if self.evaluation_strategy == IntervalStrategy::Steps && self.eval_steps == 0 {
            return fail("eval_steps must be positive with evaluation_strategy = \"steps\"".into());
        }
        if self.save_strategy == IntervalStrategy::Steps && self.save_steps == 0 {
            return fail("save_steps must be positive with save_strategy = \"steps\"".into());
        }
        if self.load_best_model_at_end {
            if self.evaluation_strategy == IntervalStrategy::No {
                return fail("load_best_model_at_end requires an evaluation_strategy".into());
            }
            if self.evaluation_strategy != self.save_strategy {
                return fail(
                    "load_best_model_at_end requires save_strategy to match evaluation_strategy"
                        .into(),
                );
            }
            if self.evaluation_strategy == IntervalStrategy::Steps
                && self.save_steps % self.eval_steps != 0
            {
                return fail("save_steps must be a multiple of eval_steps".into());
            }
        }
        if self.plm.trim().is_empty() || self.dset_name.trim().is_empty() {
            return fail("PLM and dset_name must not be empty".into());
        }
        Ok(())
    }

    /// Repository-relative path of the training split. Defaults to the
    /// Parquet shard the Hub publishes for `<task>`.
    pub fn train_file(&self) -> String {
        self.train_file
            .clone()
            .unwrap_or_else(|| format!("{}/train-00000-of-00001.parquet", self.task))
    }

    /// Repository-relative path of the validation split.
    pub fn validation_file(&self) -> String {
        self.validation_file
            .clone()
            .unwrap_or_else(|| format!("{}/validation-00000-of-00001.parquet", self.task))
    }

    /// Run name derived from the model id, e.g. `klue_bert-base-finetuned-ner`.
    pub fn run_name(&self) -> String {
        format!("{}-finetuned-ner", self.plm.replace('/', "_"))
    }

    /// Where checkpoints and the final model are written.
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.run_name()))
    }
}
