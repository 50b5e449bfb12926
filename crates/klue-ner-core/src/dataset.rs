//! # Dataset Loading
//!
//! Reads KLUE-style NER examples from the Hub's Parquet shards, JSON Lines,
//! the character-per-line KLUE TSV release, or tagged sentence markup, and
//! fetches split files from the Hugging Face Hub when they are not available
//! locally.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::error::{NerError, Result};
use crate::labels::{EntityType, NerLabel};

static ENTITY_MARKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([^<>]+?):(DT|LC|OG|PS|QT|TI)>").expect("static entity markup pattern")
});

/// A single annotated sentence: one label per unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NerExample {
    /// Annotated units, one character each for KLUE.
    pub tokens: Vec<String>,
    /// Label id per unit.
    pub ner_tags: Vec<i64>,
    /// The raw (possibly tagged) sentence, when the source carries one.
    pub sentence: Option<String>,
}

#[derive(Default, Deserialize)]
struct RawExample {
    #[serde(default)]
    tokens: Option<Vec<String>>,
    #[serde(default)]
    sentence: Option<String>,
    #[serde(default)]
    ner_tags: Option<Vec<i64>>,
}

impl NerExample {
    pub fn new(tokens: Vec<String>, ner_tags: Vec<i64>) -> Self {
        Self {
            tokens,
            ner_tags,
            sentence: None,
        }
    }

    /// The sentence the tokenizer sees: all units concatenated.
    pub fn text(&self) -> String {
        self.tokens.concat()
    }

    /// Check label ids and the label/unit count.
    pub fn validate(&self, index: usize) -> Result<()> {
        if let Some(&bad) = self
            .ner_tags
            .iter()
            .find(|&&id| NerLabel::from_id(id).is_none())
        {
            return Err(NerError::UnknownLabel(format!(
                "id {} in example {}",
                bad, index
            )));
        }
        if self.ner_tags.len() != self.tokens.len() {
            return Err(NerError::LabelCountMismatch {
                index,
                labels: self.ner_tags.len(),
                units: self.tokens.len(),
            });
        }
        Ok(())
    }

    fn from_raw(raw: RawExample, location: &str) -> Result<Self> {
        match (raw.tokens, raw.sentence, raw.ner_tags) {
            (Some(tokens), sentence, Some(ner_tags)) => Ok(Self {
                tokens,
                ner_tags,
                sentence,
            }),
            (None, Some(sentence), Some(ner_tags)) => Ok(Self {
                tokens: sentence.chars().map(String::from).collect(),
                ner_tags,
                sentence: Some(sentence),
            }),
            (None, Some(sentence), None) => Ok(parse_tagged_sentence(&sentence)),
            _ => Err(NerError::Dataset {
                location: location.to_string(),
                reason: "expected `tokens`/`ner_tags`, `sentence`/`ner_tags` or a tagged `sentence`"
                    .into(),
            }),
        }
    }
}

/// Turn `<이순신:PS>은 ...` markup into per-character BIO labels.
pub fn parse_tagged_sentence(tagged: &str) -> NerExample {
    let mut tokens = Vec::new();
    let mut ner_tags = Vec::new();
    let outside = NerLabel::Outside.id();

    let push_plain = |text: &str, tokens: &mut Vec<String>, tags: &mut Vec<i64>| {
        for c in text.chars() {
            tokens.push(c.to_string());
            tags.push(outside);
        }
    };

    let mut cursor = 0;
    for caps in ENTITY_MARKUP.captures_iter(tagged) {
        let (Some(whole), Ok(entity)) = (caps.get(0), caps[2].parse::<EntityType>()) else {
            continue;
        };
        push_plain(&tagged[cursor..whole.start()], &mut tokens, &mut ner_tags);

        for (i, c) in caps[1].chars().enumerate() {
            tokens.push(c.to_string());
            ner_tags.push(NerLabel::new(entity, i == 0).id());
        }
        cursor = whole.end();
    }
    push_plain(&tagged[cursor..], &mut tokens, &mut ner_tags);

    NerExample {
        tokens,
        ner_tags,
        sentence: Some(tagged.to_string()),
    }
}

/// Load examples from a JSON Lines file.
pub fn read_jsonl<P: AsRef<Path>>(path: P) -> Result<Vec<NerExample>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);

    let mut examples = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let location = format!("{}:{}", path.display(), line_no + 1);
        let raw: RawExample = serde_json::from_str(line).map_err(|e| NerError::Dataset {
            location: location.clone(),
            reason: e.to_string(),
        })?;
        examples.push(NerExample::from_raw(raw, &location)?);
    }

    Ok(examples)
}

fn field_string(field: &Field) -> Option<String> {
    match field {
        Field::Str(s) => Some(s.clone()),
        _ => None,
    }
}

fn field_int(field: &Field) -> Option<i64> {
    match *field {
        Field::Long(v) => Some(v),
        Field::Int(v) => Some(i64::from(v)),
        Field::Short(v) => Some(i64::from(v)),
        Field::Byte(v) => Some(i64::from(v)),
        _ => None,
    }
}

fn field_list<T>(
    field: &Field,
    item: fn(&Field) -> Option<T>,
    column: &str,
    location: &str,
) -> Result<Option<Vec<T>>> {
    let bad = || NerError::Dataset {
        location: location.to_string(),
        reason: format!("unexpected value type in column `{}`", column),
    };
    match field {
        Field::Null => Ok(None),
        Field::ListInternal(list) => list
            .elements()
            .iter()
            .map(|f| item(f).ok_or_else(bad))
            .collect::<Result<Vec<_>>>()
            .map(Some),
        _ => Err(bad()),
    }
}

/// Load examples from a Parquet shard as published on the Hub
/// (`sentence`, `tokens`, `ner_tags` columns). Other columns are ignored.
pub fn read_parquet<P: AsRef<Path>>(path: P) -> Result<Vec<NerExample>> {
    let path = path.as_ref();
    let reader = SerializedFileReader::new(File::open(path)?)?;

    let mut examples = Vec::new();
    for (row_no, row) in reader.get_row_iter(None)?.enumerate() {
        let row = row?;
        let location = format!("{}:row {}", path.display(), row_no);

        let mut raw = RawExample::default();
        for (name, field) in row.get_column_iter() {
            match name.as_str() {
                "sentence" => raw.sentence = field_string(field),
                "tokens" => raw.tokens = field_list(field, field_string, name, &location)?,
                "ner_tags" => raw.ner_tags = field_list(field, field_int, name, &location)?,
                _ => {}
            }
        }
        examples.push(NerExample::from_raw(raw, &location)?);
    }

    debug!(path = %path.display(), rows = examples.len(), "Read parquet split");
    Ok(examples)
}

/// Load examples from the KLUE TSV release: `char<TAB>tag` per line,
/// blank lines between sentences, `##` comment lines.
pub fn read_klue_tsv<P: AsRef<Path>>(path: P) -> Result<Vec<NerExample>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);

    let mut examples = Vec::new();
    let mut current = NerExample::new(Vec::new(), Vec::new());

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        // Whitespace is a unit in this format, so only the line ending goes.
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if !current.tokens.is_empty() {
                examples.push(std::mem::replace(
                    &mut current,
                    NerExample::new(Vec::new(), Vec::new()),
                ));
            }
            continue;
        }

        if let Some(comment) = line.strip_prefix("##") {
            if current.tokens.is_empty() {
                current.sentence = comment
                    .split_once('\t')
                    .map(|(_, sentence)| sentence.to_string());
            }
            continue;
        }

        let location = || format!("{}:{}", path.display(), line_no + 1);
        let (unit, tag) = line.rsplit_once('\t').ok_or_else(|| NerError::Dataset {
            location: location(),
            reason: "expected `char<TAB>tag`".into(),
        })?;
        let label: NerLabel = tag.trim().parse().map_err(|_| NerError::Dataset {
            location: location(),
            reason: format!("unknown tag {:?}", tag),
        })?;

        current.tokens.push(unit.to_string());
        current.ner_tags.push(label.id());
    }

    // Don't forget the last sentence
    if !current.tokens.is_empty() {
        examples.push(current);
    }

    Ok(examples)
}

/// Read a split file, picking the format from the extension, and validate
/// every example.
pub fn read_split<P: AsRef<Path>>(path: P) -> Result<Vec<NerExample>> {
    let path = path.as_ref();
    let examples = match path.extension().and_then(|ext| ext.to_str()) {
        Some("parquet") => read_parquet(path)?,
        Some("jsonl") | Some("json") => read_jsonl(path)?,
        Some("tsv") | Some("txt") => read_klue_tsv(path)?,
        other => {
            return Err(NerError::Dataset {
                location: path.display().to_string(),
                reason: format!("unsupported extension {:?}", other),
            });
        }
    };

    for (index, example) in examples.iter().enumerate() {
        example.validate(index)?;
    }
    Ok(examples)
}

/// Train and validation splits.
#[derive(Debug, Clone, Default)]
pub struct DatasetDict {
    pub train: Vec<NerExample>,
    pub validation: Vec<NerExample>,
}

/// Resolves split files locally or on the Hub and reads them.
pub struct DatasetLoader {
    dset_name: String,
    data_dir: Option<PathBuf>,
    revision: String,
    train_file: String,
    validation_file: String,
}

impl DatasetLoader {
    pub fn new(config: &TrainConfig) -> Self {
        Self {
            dset_name: config.dset_name.clone(),
            data_dir: config.data_dir.clone(),
            revision: config.dataset_revision.clone(),
            train_file: config.train_file(),
            validation_file: config.validation_file(),
        }
    }

    /// Load both splits.
    pub fn load(&self) -> Result<DatasetDict> {
        let train = read_split(self.resolve(&self.train_file)?)?;
        let validation = read_split(self.resolve(&self.validation_file)?)?;
        info!(
            dataset = %self.dset_name,
            train = train.len(),
            validation = validation.len(),
            "Loaded dataset"
        );
        Ok(DatasetDict { train, validation })
    }

    /// Local path (under `data_dir` when set) if it exists, otherwise a
    /// cached Hub download.
    pub fn resolve(&self, file: &str) -> Result<PathBuf> {
        let local = match &self.data_dir {
            Some(root) => root.join(file),
            None => PathBuf::from(file),
        };
        if local.exists() {
            debug!(path = %local.display(), "Using local split file");
            return Ok(local);
        }

        let hub_err = |e: hf_hub::api::sync::ApiError| NerError::Hub {
            file: file.to_string(),
            reason: e.to_string(),
        };
        let api = Api::new().map_err(hub_err)?;
        let repo = api.repo(Repo::with_revision(
            self.dset_name.clone(),
            RepoType::Dataset,
            self.revision.clone(),
        ));
        info!(repo = %self.dset_name, file, "Fetching split from the Hub");
        repo.get(file).map_err(hub_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("klue-ner-dataset-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_tagged_sentence() {
        let example = parse_tagged_sentence("<이순신:PS>은 장군");
        assert_eq!(example.text(), "이순신은 장군");
        assert_eq!(example.ner_tags, vec![6, 7, 7, 12, 12, 12, 12]);
        example.validate(0).unwrap();
    }

    #[test]
    fn test_tagged_sentence_multiple_entities() {
        let example = parse_tagged_sentence("<3월:DT> <서울:LC>");
        assert_eq!(example.text(), "3월 서울");
        assert_eq!(example.ner_tags, vec![0, 1, 12, 2, 3]);
    }

    #[test]
    fn test_tagged_sentence_without_markup() {
        let example = parse_tagged_sentence("그냥 문장");
        assert!(example.ner_tags.iter().all(|&t| t == 12));
        assert_eq!(example.tokens.len(), 5);
    }

    #[test]
    fn test_read_jsonl_shapes() {
        let path = temp_file(
            "shapes.jsonl",
            concat!(
                "{\"tokens\": [\"김\", \"철\", \"수\"], \"ner_tags\": [6, 7, 7]}\n",
                "\n",
                "{\"sentence\": \"서울\", \"ner_tags\": [2, 3]}\n",
                "{\"sentence\": \"<오늘:DT> 비\"}\n",
            ),
        );
        let examples = read_split(&path).unwrap();
        assert_eq!(examples.len(), 3);
        assert_eq!(examples[0].text(), "김철수");
        assert_eq!(examples[1].tokens, vec!["서", "울"]);
        assert_eq!(examples[2].ner_tags, vec![0, 1, 12, 12]);
    }

    #[test]
    fn test_read_jsonl_rejects_missing_fields() {
        let path = temp_file("bad.jsonl", "{\"tokens\": [\"a\"]}\n");
        let err = read_jsonl(&path).unwrap_err();
        assert!(matches!(err, NerError::Dataset { .. }));
        assert!(err.to_string().contains("bad.jsonl:1"));
    }

    #[test]
    fn test_read_split_validates_counts() {
        let path = temp_file(
            "mismatch.jsonl",
            "{\"tokens\": [\"a\", \"b\"], \"ner_tags\": [12]}\n",
        );
        let err = read_split(&path).unwrap_err();
        assert!(matches!(
            err,
            NerError::LabelCountMismatch {
                index: 0,
                labels: 1,
                units: 2
            }
        ));
    }

    #[test]
    fn test_read_split_validates_ids() {
        let path = temp_file("badid.jsonl", "{\"tokens\": [\"a\"], \"ner_tags\": [13]}\n");
        assert!(matches!(
            read_split(&path).unwrap_err(),
            NerError::UnknownLabel(_)
        ));
    }

    #[test]
    fn test_read_klue_tsv() {
        let path = temp_file(
            "sample.tsv",
            concat!(
                "## klue-ner-v1_train_00000\t<한군데:QT>서\n",
                "한\tB-QT\n",
                "군\tI-QT\n",
                "데\tI-QT\n",
                "서\tO\n",
                "\n",
                "## klue-ner-v1_train_00001\t비 온다\n",
                "비\tO\n",
                " \tO\n",
                "온\tO\n",
                "다\tO\n",
            ),
        );
        let examples = read_split(&path).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].ner_tags, vec![8, 9, 9, 12]);
        assert_eq!(examples[0].sentence.as_deref(), Some("<한군데:QT>서"));
        assert_eq!(examples[1].text(), "비 온다");
    }

    #[test]
    fn test_read_klue_tsv_bad_tag() {
        let path = temp_file("badtag.tsv", "한\tB-XX\n");
        let err = read_klue_tsv(&path).unwrap_err();
        assert!(err.to_string().contains("badtag.tsv:1"));
    }

    #[test]
    fn test_unsupported_extension() {
        let path = temp_file("data.csv", "");
        assert!(read_split(&path).is_err());
    }

    #[test]
    fn test_corrupt_parquet_is_an_error() {
        let path = temp_file("broken.parquet", "not parquet");
        assert!(matches!(read_split(&path), Err(NerError::Parquet(_))));
    }

    fn write_parquet(path: &Path, rows: &[(&str, &[&str], &[i64])]) {
        use arrow::array::{ArrayRef, Int64Builder, ListBuilder, StringArray, StringBuilder};
        use arrow::record_batch::RecordBatch;
        use parquet::arrow::ArrowWriter;
        use std::sync::Arc;

        let sentences = StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>());
        let mut tokens = ListBuilder::new(StringBuilder::new());
        let mut tags = ListBuilder::new(Int64Builder::new());
        for (_, row_tokens, row_tags) in rows {
            for t in *row_tokens {
                tokens.values().append_value(t);
            }
            tokens.append(true);
            for &tag in *row_tags {
                tags.values().append_value(tag);
            }
            tags.append(true);
        }

        let batch = RecordBatch::try_from_iter(vec![
            ("sentence", Arc::new(sentences) as ArrayRef),
            ("tokens", Arc::new(tokens.finish()) as ArrayRef),
            ("ner_tags", Arc::new(tags.finish()) as ArrayRef),
        ])
        .unwrap();

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_read_parquet_shard() {
        let dir = std::env::temp_dir().join(format!("klue-ner-parquet-{}", std::process::id()));
        let path = dir.join("shard.parquet");
        write_parquet(
            &path,
            &[
                ("<김철수:PS> 왔다", &["김", "철", "수", " ", "왔", "다"], &[6, 7, 7, 12, 12, 12]),
                ("서울", &["서", "울"], &[2, 3]),
            ],
        );

        let examples = read_split(&path).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].text(), "김철수 왔다");
        assert_eq!(examples[0].ner_tags, vec![6, 7, 7, 12, 12, 12]);
        assert_eq!(examples[0].sentence.as_deref(), Some("<김철수:PS> 왔다"));
        assert_eq!(examples[1].ner_tags, vec![2, 3]);
    }

    #[test]
    fn test_default_split_names_resolve_under_data_dir() {
        let root = std::env::temp_dir().join(format!("klue-ner-data-dir-{}", std::process::id()));
        let mut cfg =
            crate::config::TrainConfig::from_toml_str(crate::config::tests::SAMPLE).unwrap();
        cfg.data_dir = Some(root.clone());

        let rows: &[(&str, &[&str], &[i64])] = &[("비", &["비"], &[12])];
        write_parquet(&root.join(cfg.train_file()), rows);
        write_parquet(&root.join(cfg.validation_file()), rows);

        let loader = DatasetLoader::new(&cfg);
        assert_eq!(
            loader.resolve(&cfg.train_file()).unwrap(),
            root.join("ner").join("train-00000-of-00001.parquet")
        );

        let splits = loader.load().unwrap();
        assert_eq!(splits.train.len(), 1);
        assert_eq!(splits.validation[0].text(), "비");
    }

    #[test]
    fn test_resolve_prefers_local_file() {
        let path = temp_file("local.jsonl", "");
        let cfg = crate::config::TrainConfig::from_toml_str(crate::config::tests::SAMPLE).unwrap();
        let loader = DatasetLoader::new(&cfg);
        let resolved = loader.resolve(path.to_str().unwrap()).unwrap();
        assert_eq!(resolved, path);
    }
}
