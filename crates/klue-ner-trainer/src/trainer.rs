//! Fine-tuning loop: batching, AdamW updates with gradient accumulation,
//! periodic evaluation, checkpoint rotation and best-model restore.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use klue_ner_core::{
    compute_metrics, BestMetric, DatasetLoader, EvalReport, IntervalStrategy, NerExample,
    NerLabel, Preprocessor, TokenizedExample, TrainConfig,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collator::DataCollator;
use crate::loss::masked_cross_entropy;
use crate::model::{fetch_pretrained, PretrainedFiles, TokenClassifier};
use crate::schedule::LinearSchedule;

const WEIGHTS_FILE: &str = "model.safetensors";
const STATE_FILE: &str = "trainer_state.json";

/// One entry of the training log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub step: usize,
    /// 1-based epoch the entry was recorded in.
    pub epoch: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval: Option<EvalReport>,
}

/// Progress written next to every checkpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainerState {
    pub global_step: usize,
    /// Current epoch, 1-based; 0 before training starts.
    pub epoch: usize,
    pub best_metric: Option<f64>,
    pub best_checkpoint: Option<PathBuf>,
    pub log_history: Vec<LogEntry>,
}

/// Value of the selection metric in a report.
pub fn metric_value(report: &EvalReport, metric: BestMetric) -> Option<f64> {
    match metric {
        BestMetric::F1 => Some(report.f1),
        BestMetric::Precision => Some(report.precision),
        BestMetric::Recall => Some(report.recall),
        BestMetric::Accuracy => Some(report.accuracy),
        BestMetric::Loss => report.loss,
    }
}

fn is_improvement(candidate: f64, best: Option<f64>, metric: BestMetric) -> bool {
    match best {
        None => true,
        Some(best) if metric.greater_is_better() => candidate > best,
        Some(best) => candidate < best,
    }
}

/// Checkpoints to delete so that at most `limit` remain, never the best one.
/// A `limit` of 0 keeps everything.
pub fn checkpoints_to_delete(
    checkpoints: &[PathBuf],
    best: Option<&Path>,
    limit: usize,
) -> Vec<PathBuf> {
    if limit == 0 || checkpoints.len() <= limit {
        return Vec::new();
    }

    // The best checkpoint is treated as the newest so rotation skips it.
    let mut ordered: Vec<&PathBuf> = checkpoints
        .iter()
        .filter(|c| Some(c.as_path()) != best)
        .collect();
    let best_is_tracked = best.is_some_and(|b| checkpoints.iter().any(|c| c == b));
    let best_is_latest = best.is_some_and(|b| checkpoints.last().is_some_and(|c| c == b));

    let limit = if limit == 1 && best_is_tracked && !best_is_latest {
        2
    } else {
        limit
    };
    let keep_from_ordered = limit.saturating_sub(usize::from(best_is_tracked));

    let excess = ordered.len().saturating_sub(keep_from_ordered);
    ordered.truncate(excess);
    ordered.into_iter().cloned().collect()
}

/// Deterministic Fisher-Yates shuffle.
fn shuffled_indices(len: usize, rng: &mut oorandom::Rand32) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.rand_range(0..(i as u32 + 1)) as usize;
        indices.swap(i, j);
    }
    indices
}

/// Add `grads` into the running sum for every trainable variable.
fn accumulate(
    total: &mut Option<GradStore>,
    mut grads: GradStore,
    vars: &[Var],
) -> candle_core::Result<()> {
    let Some(sum) = total.as_mut() else {
        *total = Some(grads);
        return Ok(());
    };
    for var in vars {
        if let Some(grad) = grads.remove(var) {
            let merged = match sum.get(var) {
                Some(prev) => (prev + &grad)?,
                None => grad,
            };
            sum.insert(var, merged);
        }
    }
    Ok(())
}

pub struct Trainer<'a> {
    config: &'a TrainConfig,
    model: TokenClassifier,
    collator: DataCollator,
    optimizer: AdamW,
    vars: Vec<Var>,
    device: Device,
    output_dir: PathBuf,
    rng: oorandom::Rand32,
    checkpoints: Vec<PathBuf>,
    last_eval: Option<(usize, EvalReport)>,
    state: TrainerState,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &'a TrainConfig, model: TokenClassifier, device: Device) -> Result<Self> {
        let vars = model.trainable_vars();
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        Ok(Self {
            config,
            collator: DataCollator::new(model.pad_token_id()),
            model,
            optimizer,
            vars,
            device,
            output_dir: config.output_dir(),
            rng: oorandom::Rand32::new(config.seed),
            checkpoints: Vec::new(),
            last_eval: None,
            state: TrainerState::default(),
        })
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn model(&self) -> &TokenClassifier {
        &self.model
    }

    /// Run `num_epochs` over `train`, evaluating on `eval` per the strategy.
    pub fn train(&mut self, train: &[TokenizedExample], eval: &[TokenizedExample]) -> Result<()> {
        if train.is_empty() {
            anyhow::bail!("Training split is empty");
        }

        let cfg = self.config;
        let accum = cfg.gradient_accumulation_steps;
        let num_batches = train.len().div_ceil(cfg.train_batch_size);
        let steps_per_epoch = num_batches.div_ceil(accum);
        let total_steps = steps_per_epoch * cfg.num_epochs;
        let schedule = LinearSchedule::new(cfg.learning_rate, total_steps, cfg.warmup_ratio);

        info!(
            examples = train.len(),
            epochs = cfg.num_epochs,
            batch_size = cfg.train_batch_size,
            accumulation = accum,
            total_steps,
            warmup_steps = schedule.warmup_steps(),
            "Starting training"
        );

        for epoch in 0..cfg.num_epochs {
            self.state.epoch = epoch + 1;
            let order = shuffled_indices(train.len(), &mut self.rng);

            let mut accumulated: Option<GradStore> = None;
            let mut micro_steps = 0usize;
            let mut window_loss = 0f64;
            let mut window_batches = 0usize;

            for (batch_idx, chunk) in order.chunks(cfg.train_batch_size).enumerate() {
                let examples: Vec<&TokenizedExample> = chunk.iter().map(|&i| &train[i]).collect();
                let batch = self.collator.collate(&examples, &self.device)?;

                let logits = self.model.forward(&batch, true)?;
                let loss = masked_cross_entropy(&logits, &batch.labels)?;
                let grads = (&loss / accum as f64)?.backward()?;
                accumulate(&mut accumulated, grads, &self.vars)?;

                window_loss += f64::from(loss.to_scalar::<f32>()?);
                window_batches += 1;
                micro_steps += 1;

                let last_batch = batch_idx + 1 == num_batches;
                if micro_steps < accum && !last_batch {
                    continue;
                }

                let lr = schedule.lr_at(self.state.global_step);
                self.optimizer.set_learning_rate(lr);
                if let Some(grads) = accumulated.take() {
                    self.optimizer.step(&grads)?;
                }
                micro_steps = 0;
                self.state.global_step += 1;
                let step = self.state.global_step;

                if step % cfg.logging_steps == 0 {
                    let mean = window_loss / window_batches.max(1) as f64;
                    info!(step, epoch = self.state.epoch, loss = mean, lr, "Training progress");
                    self.state.log_history.push(LogEntry {
                        step,
                        epoch: self.state.epoch,
                        loss: Some(mean),
                        learning_rate: Some(lr),
                        eval: None,
                    });
                    window_loss = 0.0;
                    window_batches = 0;
                }

                if cfg.evaluation_strategy == IntervalStrategy::Steps && step % cfg.eval_steps == 0
                {
                    self.run_evaluation(eval)?;
                }
                if cfg.save_strategy == IntervalStrategy::Steps && step % cfg.save_steps == 0 {
                    self.save_checkpoint()?;
                }
            }

            info!(epoch = self.state.epoch, step = self.state.global_step, "Epoch complete");
            if cfg.evaluation_strategy == IntervalStrategy::Epoch {
                self.run_evaluation(eval)?;
            }
            if cfg.save_strategy == IntervalStrategy::Epoch {
                self.save_checkpoint()?;
            }
        }

        if cfg.load_best_model_at_end {
            self.restore_best()?;
        }
        Ok(())
    }

    /// Evaluate and record the report in the log history.
    fn run_evaluation(&mut self, eval: &[TokenizedExample]) -> Result<()> {
        let report = self.evaluate(eval)?;
        let step = self.state.global_step;
        info!(
            step,
            epoch = self.state.epoch,
            f1 = report.f1,
            precision = report.precision,
            recall = report.recall,
            accuracy = report.accuracy,
            loss = report.loss,
            "Evaluation"
        );
        self.state.log_history.push(LogEntry {
            step,
            epoch: self.state.epoch,
            loss: None,
            learning_rate: None,
            eval: Some(report.clone()),
        });
        self.last_eval = Some((step, report));
        Ok(())
    }

    /// Predict over `data` and score against its labels.
    pub fn evaluate(&self, data: &[TokenizedExample]) -> Result<EvalReport> {
        let mut predictions = Vec::with_capacity(data.len());
        let mut labels = Vec::with_capacity(data.len());
        let mut loss_sum = 0f64;
        let mut batches = 0usize;

        for chunk in data.chunks(self.config.valid_batch_size) {
            let examples: Vec<&TokenizedExample> = chunk.iter().collect();
            let batch = self.collator.collate(&examples, &self.device)?;
            let logits = self.model.forward(&batch, false)?;

            let loss = masked_cross_entropy(&logits, &batch.labels)?;
            loss_sum += f64::from(loss.to_scalar::<f32>()?);
            batches += 1;

            let predicted = logits.argmax(D::Minus1)?.to_vec2::<u32>()?;
            for (example, row) in chunk.iter().zip(predicted) {
                predictions.push(
                    row.into_iter()
                        .take(example.len())
                        .map(i64::from)
                        .collect::<Vec<_>>(),
                );
                labels.push(example.labels.clone());
            }
        }

        let mut report = compute_metrics(&predictions, &labels)?;
        report.loss = (batches > 0).then(|| loss_sum / batches as f64);
        Ok(report)
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let step = self.state.global_step;
        let dir = self.output_dir.join(format!("checkpoint-{}", step));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let metric = self.config.metric_for_best_model;
        let fresh_value = self
            .last_eval
            .as_ref()
            .filter(|(eval_step, _)| *eval_step == step)
            .and_then(|(_, report)| metric_value(report, metric));
        if let Some(value) = fresh_value {
            if is_improvement(value, self.state.best_metric, metric) {
                self.state.best_metric = Some(value);
                self.state.best_checkpoint = Some(dir.clone());
            }
        }

        self.model.save(dir.join(WEIGHTS_FILE))?;
        std::fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(&self.state)?)?;
        self.checkpoints.push(dir.clone());
        info!(path = %dir.display(), "Saved checkpoint");

        let stale = checkpoints_to_delete(
            &self.checkpoints,
            self.state.best_checkpoint.as_deref(),
            self.config.num_checkpoints,
        );
        for old in stale {
            std::fs::remove_dir_all(&old)
                .with_context(|| format!("Failed to remove {}", old.display()))?;
            self.checkpoints.retain(|c| c != &old);
            debug!(path = %old.display(), "Removed old checkpoint");
        }
        Ok(())
    }

    fn restore_best(&mut self) -> Result<()> {
        match self.state.best_checkpoint.clone() {
            Some(dir) => {
                info!(
                    path = %dir.display(),
                    metric = ?self.config.metric_for_best_model,
                    value = self.state.best_metric,
                    "Loading best model"
                );
                self.model.load_checkpoint(dir.join(WEIGHTS_FILE))
            }
            None => {
                warn!("No evaluated checkpoint to restore; keeping final weights");
                Ok(())
            }
        }
    }

    /// Write the final weights, tokenizer, encoder config and label map.
    pub fn save_final(&self, files: &PretrainedFiles) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        self.model.save(self.output_dir.join(WEIGHTS_FILE))?;
        std::fs::copy(&files.tokenizer, self.output_dir.join("tokenizer.json"))?;
        std::fs::copy(&files.config, self.output_dir.join("config.json"))?;

        let id2label: Vec<String> = NerLabel::all_labels().iter().map(|l| l.to_string()).collect();
        std::fs::write(
            self.output_dir.join("labels.json"),
            serde_json::to_string_pretty(&id2label)?,
        )?;
        std::fs::write(
            self.output_dir.join(STATE_FILE),
            serde_json::to_string_pretty(&self.state)?,
        )?;

        info!(path = %self.output_dir.display(), "Saved final model");
        Ok(self.output_dir.clone())
    }
}

/// Log the first training sentence with its per-token labels.
fn log_debug_sample(preprocessor: &Preprocessor, example: &NerExample) -> Result<()> {
    info!(
        sentence = %example.sentence.clone().unwrap_or_else(|| example.text()),
        "Debug sample"
    );
    info!("------Labeled output------");
    for (idx, token, label) in preprocessor.debug_rows(example)? {
        info!("{} {} {}", idx, token, label);
    }
    Ok(())
}

fn select_dtype(config: &TrainConfig, device: &Device) -> DType {
    match (config.fp16, device.is_cuda()) {
        (true, true) => DType::F16,
        (true, false) => {
            warn!("fp16 requested but no CUDA device is available; training in f32");
            DType::F32
        }
        (false, _) => DType::F32,
    }
}

/// Fine-tune the configured model end to end and return the final
/// validation report.
pub fn run_training(config: &TrainConfig) -> Result<EvalReport> {
    let device = Device::cuda_if_available(0)?;
    // Head init and shuffling are seeded separately; this only covers dropout.
    if let Err(e) = device.set_seed(config.seed) {
        warn!(error = %e, "Device RNG cannot be seeded; dropout masks are not reproducible");
    }

    let datasets = DatasetLoader::new(config).load()?;
    let files = fetch_pretrained(&config.plm)?;
    let preprocessor = Preprocessor::from_file(&files.tokenizer, config)?;

    if config.debug {
        if let Some(first) = datasets.train.first() {
            log_debug_sample(&preprocessor, first)?;
        }
    }

    let train = preprocessor.process_all(&datasets.train)?;
    let validation = preprocessor.process_all(&datasets.validation)?;

    let dtype = select_dtype(config, &device);
    let model =
        TokenClassifier::from_pretrained(&files, config.num_labels, config.seed, &device, dtype)?;
    info!(device = ?device, dtype = ?dtype, labels = model.num_labels(), "Model ready");

    let mut trainer = Trainer::new(config, model, device)?;
    trainer.train(&train, &validation)?;

    let report = trainer.evaluate(&validation)?;
    info!(
        f1 = report.f1,
        precision = report.precision,
        recall = report.recall,
        accuracy = report.accuracy,
        "Final evaluation"
    );
    trainer.save_final(&files)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    fn report(f1: f64, loss: f64) -> EvalReport {
        EvalReport {
            precision: f1,
            recall: f1,
            f1,
            accuracy: 0.9,
            loss: Some(loss),
            per_type: BTreeMap::new(),
        }
    }

    #[test]
    fn test_rotation_keeps_latest() {
        let ckpts = paths(&["c-1", "c-2", "c-3"]);
        assert_eq!(checkpoints_to_delete(&ckpts, None, 2), paths(&["c-1"]));
        assert!(checkpoints_to_delete(&ckpts, None, 3).is_empty());
        assert!(checkpoints_to_delete(&ckpts, None, 0).is_empty());
    }

    #[test]
    fn test_rotation_spares_best() {
        let ckpts = paths(&["c-1", "c-2", "c-3", "c-4"]);
        let best = PathBuf::from("c-1");
        assert_eq!(
            checkpoints_to_delete(&ckpts, Some(&best), 2),
            paths(&["c-2", "c-3"])
        );
    }

    #[test]
    fn test_rotation_limit_one_keeps_best_and_latest() {
        let ckpts = paths(&["c-1", "c-2", "c-3"]);
        let best = PathBuf::from("c-2");
        assert_eq!(checkpoints_to_delete(&ckpts, Some(&best), 1), paths(&["c-1"]));

        let best = PathBuf::from("c-3");
        assert_eq!(
            checkpoints_to_delete(&ckpts, Some(&best), 1),
            paths(&["c-1", "c-2"])
        );
    }

    #[test]
    fn test_metric_direction() {
        assert!(is_improvement(0.8, Some(0.7), BestMetric::F1));
        assert!(!is_improvement(0.6, Some(0.7), BestMetric::F1));
        assert!(is_improvement(0.2, Some(0.3), BestMetric::Loss));
        assert!(is_improvement(5.0, None, BestMetric::Loss));
        assert_eq!(metric_value(&report(0.5, 1.2), BestMetric::Loss), Some(1.2));
        assert_eq!(metric_value(&report(0.5, 1.2), BestMetric::F1), Some(0.5));
    }

    fn tiny_config(output_dir: &Path) -> TrainConfig {
        TrainConfig::from_toml_str(&format!(
            r#"
[CFG]
dset_name = "klue/klue"
task = "ner"
PLM = "tiny"
max_token_length = 16
num_labels = 13
DEBUG = false
seed = 3

num_epochs = 2
train_batch_size = 1
valid_batch_size = 2
gradient_accumulation_steps = 2
learning_rate = 1e-3
weight_decay = 0.0
warmup_ratio = 0.0
fp16 = false

evaluation_strategy = "steps"
save_strategy = "steps"
save_steps = 1
eval_steps = 1
logging_steps = 1
num_checkpoints = 1
load_best_model_at_end = true
metric_for_best_model = "loss"
output_dir = "{}"
"#,
            output_dir.display()
        ))
        .unwrap()
    }

    fn tokenized(input_ids: &[u32], labels: &[i64]) -> TokenizedExample {
        let offsets = (0..input_ids.len())
            .map(|i| match i {
                0 => (0, 0),
                i if i + 1 == input_ids.len() => (0, 0),
                i => (i - 1, i),
            })
            .collect();
        TokenizedExample {
            input_ids: input_ids.to_vec(),
            attention_mask: vec![1; input_ids.len()],
            offsets,
            labels: labels.to_vec(),
        }
    }

    fn weights(path: &Path) -> BTreeMap<String, Vec<f32>> {
        candle_core::safetensors::load(path, &Device::Cpu)
            .unwrap()
            .into_iter()
            .map(|(name, t)| (name, t.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect()
    }

    #[test]
    fn test_train_rotates_checkpoints_and_restores_best() {
        let dir = std::env::temp_dir().join(format!("klue-ner-train-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config = tiny_config(&dir);

        let train = vec![
            tokenized(&[2, 5, 6, 3], &[-100, 6, 7, -100]),
            tokenized(&[2, 7, 8, 9, 3], &[-100, 12, 10, 11, -100]),
            tokenized(&[2, 10, 3], &[-100, 0, -100]),
        ];
        let model = crate::model::tests::tiny_model(config.seed);
        let mut trainer = Trainer::new(&config, model, Device::Cpu).unwrap();
        trainer.train(&train, &train).unwrap();

        // 3 batches of 1 with accumulation 2 make 2 optimizer steps per epoch.
        let state = trainer.state();
        assert_eq!(state.global_step, train.len().div_ceil(2) * config.num_epochs);
        assert_eq!(state.global_step, 4);
        assert_eq!(state.epoch, 2);
        assert_eq!(state.log_history.first().map(|e| e.epoch), Some(1));
        assert!(state.log_history.iter().all(|e| (1..=2).contains(&e.epoch)));
        assert_eq!(state.log_history.iter().filter(|e| e.eval.is_some()).count(), 4);

        let best = state.best_checkpoint.clone().expect("an evaluated checkpoint");
        assert!(best.join(WEIGHTS_FILE).exists());
        assert!(state.best_metric.is_some());

        let latest = dir.join("checkpoint-4");
        let mut remaining: Vec<PathBuf> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        remaining.sort();
        let mut expected = vec![best.clone(), latest.clone()];
        expected.sort();
        expected.dedup();
        assert_eq!(remaining, expected);

        let restored = dir.join("restored.safetensors");
        trainer.model().save(&restored).unwrap();
        let restored = weights(&restored);
        assert_eq!(restored, weights(&best.join(WEIGHTS_FILE)));
        if best != latest {
            assert_ne!(restored, weights(&latest.join(WEIGHTS_FILE)));
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_evaluate_reports_loss() {
        let dir = std::env::temp_dir().join(format!("klue-ner-eval-{}", std::process::id()));
        let config = tiny_config(&dir);
        let data = vec![
            tokenized(&[2, 5, 6, 3], &[-100, 6, 7, -100]),
            tokenized(&[2, 7, 3], &[-100, 12, -100]),
            tokenized(&[2, 8, 9, 10, 3], &[-100, 0, 1, 12, -100]),
        ];
        let trainer =
            Trainer::new(&config, crate::model::tests::tiny_model(0), Device::Cpu).unwrap();
        let report = trainer.evaluate(&data).unwrap();
        assert!(report.loss.is_some_and(|l| l.is_finite() && l > 0.0));
        assert!((0.0..=1.0).contains(&report.accuracy));
        assert!(!dir.exists());
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() {
        let a = shuffled_indices(50, &mut oorandom::Rand32::new(42));
        let b = shuffled_indices(50, &mut oorandom::Rand32::new(42));
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }
}
