//! BERT or RoBERTa encoder with a linear token-classification head.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Dropout, Linear, Module, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use candle_transformers::models::xlm_roberta::{Config as RobertaConfig, XLMRobertaModel};
use hf_hub::api::sync::Api;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::collator::Batch;

/// Files making up a pretrained checkpoint on the Hub.
#[derive(Debug, Clone)]
pub struct PretrainedFiles {
    pub config: PathBuf,
    /// `model.safetensors`, or `pytorch_model.bin` when the repo has no
    /// safetensors export.
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

/// Download (or reuse from the hub cache) the files of `model_id`.
pub fn fetch_pretrained(model_id: &str) -> Result<PretrainedFiles> {
    let api = Api::new().context("Failed to create Hugging Face Hub client")?;
    let repo = api.model(model_id.to_string());

    let config = repo
        .get("config.json")
        .with_context(|| format!("{}: config.json", model_id))?;
    let weights = repo
        .get("model.safetensors")
        .or_else(|_| repo.get("pytorch_model.bin"))
        .with_context(|| format!("{}: model.safetensors or pytorch_model.bin", model_id))?;
    let tokenizer = repo
        .get("tokenizer.json")
        .with_context(|| format!("{}: tokenizer.json", model_id))?;

    info!(model = model_id, weights = %weights.display(), "Fetched pretrained checkpoint");
    Ok(PretrainedFiles {
        config,
        weights,
        tokenizer,
    })
}

/// Encoder family, from `model_type` in `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Bert,
    Roberta,
}

impl Architecture {
    pub fn from_model_type(model_type: Option<&str>) -> Result<Self> {
        match model_type {
            None | Some("bert") => Ok(Architecture::Bert),
            Some("roberta") | Some("xlm-roberta") => Ok(Architecture::Roberta),
            Some(other) => anyhow::bail!("Unsupported encoder model_type `{}`", other),
        }
    }

    /// Variable prefix used by Hugging Face `*ForTokenClassification`.
    pub fn prefix(self) -> &'static str {
        match self {
            Architecture::Bert => "bert",
            Architecture::Roberta => "roberta",
        }
    }
}

/// The `config.json` fields the head needs beyond the encoder config.
#[derive(Debug, Clone, Deserialize)]
pub struct HeadConfig {
    pub hidden_size: usize,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f32,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f32,
    #[serde(default)]
    pub model_type: Option<String>,
}

fn default_dropout() -> f32 {
    0.1
}

fn default_initializer_range() -> f32 {
    0.02
}

enum Encoder {
    Bert(BertModel),
    Roberta(XLMRobertaModel),
}

/// Token classifier: encoder, dropout, `classifier` linear layer. Variable
/// names follow Hugging Face's `*ForTokenClassification`.
pub struct TokenClassifier {
    encoder: Encoder,
    dropout: Dropout,
    classifier: Linear,
    varmap: VarMap,
    head: HeadConfig,
    architecture: Architecture,
    num_labels: usize,
}

impl TokenClassifier {
    /// Build a freshly initialised model from `config.json` text. The head
    /// weights are drawn from N(0, initializer_range) with `seed`, the bias
    /// starts at zero.
    pub fn new(
        config_json: &str,
        num_labels: usize,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let head: HeadConfig =
            serde_json::from_str(config_json).context("Failed to parse head config")?;
        let architecture = Architecture::from_model_type(head.model_type.as_deref())?;

        // The RoBERTa encoder builds its attention mask in f32.
        let dtype = if architecture == Architecture::Roberta && dtype != DType::F32 {
            warn!(?dtype, "RoBERTa encoder runs in f32");
            DType::F32
        } else {
            dtype
        };

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let encoder_vb = vb.pp(architecture.prefix());
        let encoder = match architecture {
            Architecture::Bert => {
                let config: BertConfig =
                    serde_json::from_str(config_json).context("Failed to parse BERT config")?;
                Encoder::Bert(BertModel::load(encoder_vb, &config)?)
            }
            Architecture::Roberta => {
                let config = roberta_config(config_json)?;
                Encoder::Roberta(XLMRobertaModel::new(&config, encoder_vb)?)
            }
        };
        let classifier = candle_nn::linear(head.hidden_size, num_labels, vb.pp("classifier"))?;

        let weight = Tensor::from_vec(
            seeded_normal(num_labels * head.hidden_size, head.initializer_range, seed),
            (num_labels, head.hidden_size),
            device,
        )?
        .to_dtype(dtype)?;
        varmap.set_one("classifier.weight", &weight)?;
        varmap.set_one("classifier.bias", Tensor::zeros(num_labels, dtype, device)?)?;

        Ok(Self {
            encoder,
            dropout: Dropout::new(head.hidden_dropout_prob),
            classifier,
            varmap,
            head,
            architecture,
            num_labels,
        })
    }

    /// Build the model and copy pretrained encoder weights into it.
    pub fn from_pretrained(
        files: &PretrainedFiles,
        num_labels: usize,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config_json = std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;

        let model = Self::new(&config_json, num_labels, seed, device, dtype)?;
        model.load_pretrained(&files.weights, device)?;
        Ok(model)
    }

    /// Copy matching tensors from a Hugging Face checkpoint. The head is
    /// expected to be missing; anything else missing is logged.
    pub fn load_pretrained(&self, weights: &Path, device: &Device) -> Result<usize> {
        let tensors = read_weights(weights, device)
            .with_context(|| format!("Failed to load {}", weights.display()))?;

        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;

        let mut loaded = 0usize;
        let mut missing = Vec::new();
        for (name, var) in vars.iter() {
            let found = checkpoint_names(name)
                .iter()
                .find_map(|candidate| tensors.get(candidate));
            match found {
                Some(tensor) => {
                    var.set(&tensor.to_dtype(var.dtype())?)
                        .with_context(|| format!("Shape mismatch for {}", name))?;
                    loaded += 1;
                }
                None => missing.push(name.clone()),
            }
        }

        let unexpected: Vec<_> = missing
            .iter()
            .filter(|name| !name.starts_with("classifier."))
            .collect();
        if !unexpected.is_empty() {
            warn!(
                count = unexpected.len(),
                names = ?unexpected,
                "Encoder weights not found in checkpoint"
            );
        }
        info!(
            architecture = ?self.architecture,
            loaded,
            fresh = missing.len(),
            "Initialised model from pretrained weights"
        );
        Ok(loaded)
    }

    /// Emission logits, `[batch, seq_len, num_labels]`.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let hidden = match &self.encoder {
            Encoder::Bert(bert) => bert.forward(
                &batch.input_ids,
                &batch.token_type_ids,
                Some(&batch.attention_mask),
            )?,
            Encoder::Roberta(roberta) => roberta.forward(
                &batch.input_ids,
                &batch.attention_mask,
                &batch.token_type_ids,
                None,
                None,
                None,
            )?,
        };
        let hidden = self.dropout.forward(&hidden, train)?;
        Ok(self.classifier.forward(&hidden)?)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn pad_token_id(&self) -> u32 {
        self.head.pad_token_id
    }

    /// Write all weights as safetensors.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .save(path)
            .with_context(|| format!("Failed to save weights to {}", path.display()))?;
        debug!(path = %path.display(), "Saved weights");
        Ok(())
    }

    /// Restore weights written by [`TokenClassifier::save`].
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .load(path)
            .with_context(|| format!("Failed to load weights from {}", path.display()))?;
        info!(path = %path.display(), "Restored weights");
        Ok(())
    }
}

/// XLM-R config from `config.json`, filling keys older RoBERTa exports omit.
fn roberta_config(config_json: &str) -> Result<RobertaConfig> {
    let mut value: serde_json::Value =
        serde_json::from_str(config_json).context("Failed to parse RoBERTa config")?;
    if let Some(fields) = value.as_object_mut() {
        fields
            .entry("position_embedding_type")
            .or_insert_with(|| serde_json::json!("absolute"));
        fields
            .entry("attention_probs_dropout_prob")
            .or_insert_with(|| serde_json::json!(0.1));
    }
    serde_json::from_value(value).context("Failed to parse RoBERTa config")
}

fn read_weights(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if path.extension().is_some_and(|ext| ext == "safetensors") {
        return Ok(candle_core::safetensors::load(path, device)?);
    }
    candle_core::pickle::read_all(path)?
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
        .collect()
}

/// `len` samples of N(0, std) via Box-Muller on a seeded generator.
fn seeded_normal(len: usize, std: f32, seed: u64) -> Vec<f32> {
    let mut rng = oorandom::Rand32::new(seed);
    (0..len)
        .map(|_| {
            let u1 = rng.rand_float().max(f32::MIN_POSITIVE);
            let u2 = rng.rand_float();
            (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos() * std
        })
        .collect()
}

/// Names a variable may carry in a checkpoint: as-is, without the encoder
/// prefix (bare encoder checkpoints), and with TF-era `gamma`/`beta`.
fn checkpoint_names(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    if let Some(stripped) = name
        .strip_prefix("bert.")
        .or_else(|| name.strip_prefix("roberta."))
    {
        names.push(stripped.to_string());
    }
    let legacy: Vec<String> = names
        .iter()
        .filter_map(|n| {
            n.strip_suffix("LayerNorm.weight")
                .map(|p| format!("{}LayerNorm.gamma", p))
                .or_else(|| {
                    n.strip_suffix("LayerNorm.bias")
                        .map(|p| format!("{}LayerNorm.beta", p))
                })
        })
        .collect();
    names.extend(legacy);
    names
}
