//! # Entity-Level Evaluation
//!
//! seqeval-compatible scoring through `rusev`: entity chunks are read off
//! IOB2 sequences in lenient mode and compared exactly (type, start, end)
//! per sentence. Token accuracy is counted alongside.

use std::collections::{BTreeMap, HashSet};

use rusev::{classification_report, Average, ClassMetrics, DivByZeroStrat};
use serde::Serialize;

use crate::error::{NerError, Result};
use crate::labels::{NerLabel, IGNORE_INDEX};

/// Precision/recall/F1 for one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TypeScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of gold entities of this type.
    pub support: usize,
}

/// Aggregate evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    /// Micro-averaged entity precision.
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Token-level accuracy over non-ignored positions.
    pub accuracy: f64,
    /// Mean evaluation loss, filled in by the trainer.
    pub loss: Option<f64>,
    pub per_type: BTreeMap<String, TypeScores>,
}

impl EvalReport {
    fn without_entities(accuracy: f64) -> Self {
        Self {
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
            accuracy,
            loss: None,
            per_type: BTreeMap::new(),
        }
    }
}

/// Score predicted label sequences against gold ones.
pub fn evaluate(gold: &[Vec<NerLabel>], predicted: &[Vec<NerLabel>]) -> Result<EvalReport> {
    if gold.len() != predicted.len() {
        return Err(NerError::Metrics(format!(
            "{} gold sequences but {} predicted",
            gold.len(),
            predicted.len()
        )));
    }

    let mut y_true = Vec::with_capacity(gold.len());
    let mut y_pred = Vec::with_capacity(gold.len());
    let mut correct = 0usize;
    let mut total = 0usize;

    for (sent, (g, p)) in gold.iter().zip(predicted).enumerate() {
        if g.len() != p.len() {
            return Err(NerError::Metrics(format!(
                "sequence {} has {} gold and {} predicted labels",
                sent,
                g.len(),
                p.len()
            )));
        }
        if g.is_empty() {
            continue;
        }
        total += g.len();
        correct += g.iter().zip(p).filter(|(a, b)| a == b).count();
        y_true.push(g.iter().map(NerLabel::as_str).collect::<Vec<_>>());
        y_pred.push(p.iter().map(NerLabel::as_str).collect::<Vec<_>>());
    }

    let accuracy = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };

    // Nothing to chunk on either side: seqeval reports zeros.
    let has_entity = |rows: &[Vec<&str>]| rows.iter().flatten().any(|&tag| tag != "O");
    if !has_entity(&y_true) && !has_entity(&y_pred) {
        return Ok(EvalReport::without_entities(accuracy));
    }

    let report = classification_report(
        y_true,
        y_pred,
        None,
        DivByZeroStrat::ReplaceBy0,
        None,
        false,
        false,
    )
    .map_err(|e| NerError::Metrics(e.to_string()))?;

    let mut micro = None;
    let mut per_type = BTreeMap::new();
    for metrics in HashSet::<ClassMetrics>::from(report) {
        match metrics.average {
            Average::Micro => micro = Some(metrics),
            Average::None => {
                per_type.insert(
                    metrics.class,
                    TypeScores {
                        precision: f64::from(metrics.precision),
                        recall: f64::from(metrics.recall),
                        f1: f64::from(metrics.fscore),
                        support: metrics.support,
                    },
                );
            }
            _ => {}
        }
    }
    let micro = micro.ok_or_else(|| NerError::Metrics("report has no micro average".into()))?;

    Ok(EvalReport {
        precision: f64::from(micro.precision),
        recall: f64::from(micro.recall),
        f1: f64::from(micro.fscore),
        accuracy,
        loss: None,
        per_type,
    })
}

/// Score per-token id sequences, dropping positions whose gold id is `-100`.
pub fn compute_metrics(predictions: &[Vec<i64>], labels: &[Vec<i64>]) -> Result<EvalReport> {
    let to_label = |id: i64| {
        NerLabel::from_id(id).ok_or_else(|| NerError::UnknownLabel(format!("id {}", id)))
    };

    let mut gold = Vec::with_capacity(labels.len());
    let mut predicted = Vec::with_capacity(labels.len());

    for (pred_row, gold_row) in predictions.iter().zip(labels) {
        let mut g = Vec::with_capacity(gold_row.len());
        let mut p = Vec::with_capacity(gold_row.len());
        for (&pred_id, &gold_id) in pred_row.iter().zip(gold_row) {
            if gold_id == IGNORE_INDEX {
                continue;
            }
            g.push(to_label(gold_id)?);
            p.push(to_label(pred_id)?);
        }
        gold.push(g);
        predicted.push(p);
    }

    evaluate(&gold, &predicted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(names: &[&str]) -> Vec<NerLabel> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_perfect_prediction() {
        let gold = vec![seq(&["B-OG", "I-OG", "O"]), seq(&["B-QT"])];
        let report = evaluate(&gold, &gold).unwrap();
        assert!(close(report.f1, 1.0));
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.per_type["OG"].support, 1);
        assert_eq!(report.per_type["QT"].support, 1);
    }

    #[test]
    fn test_partial_match() {
        let gold = vec![
            seq(&["O", "O", "O", "B-LC", "I-LC", "I-LC", "O"]),
            seq(&["B-PS", "I-PS", "O"]),
        ];
        let predicted = vec![
            seq(&["O", "O", "B-LC", "I-LC", "I-LC", "I-LC", "O"]),
            seq(&["B-PS", "I-PS", "O"]),
        ];
        let report = evaluate(&gold, &predicted).unwrap();
        assert!(close(report.precision, 0.5));
        assert!(close(report.recall, 0.5));
        assert!(close(report.f1, 0.5));
        assert!(close(report.accuracy, 0.8));
        assert!(close(report.per_type["LC"].f1, 0.0));
        assert!(close(report.per_type["PS"].f1, 1.0));
    }

    #[test]
    fn test_inside_without_begin_opens_chunk() {
        let gold = vec![seq(&["O", "I-PS", "I-PS", "O"])];
        let predicted = vec![seq(&["O", "B-PS", "I-PS", "O"])];
        let report = evaluate(&gold, &predicted).unwrap();
        assert!(close(report.f1, 1.0));
        assert_eq!(report.per_type["PS"].support, 1);
    }

    #[test]
    fn test_consecutive_begins_are_separate_chunks() {
        let gold = vec![seq(&["B-LC", "B-LC"])];
        let predicted = vec![seq(&["B-LC", "I-LC"])];
        let report = evaluate(&gold, &predicted).unwrap();
        assert_eq!(report.per_type["LC"].support, 2);
        assert!(close(report.f1, 0.0));
    }

    #[test]
    fn test_no_entities() {
        let gold = vec![seq(&["O", "O"])];
        let report = evaluate(&gold, &gold).unwrap();
        assert_eq!(report.f1, 0.0);
        assert_eq!(report.accuracy, 1.0);
        assert!(report.per_type.is_empty());
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let gold = vec![seq(&["B-PS", "O"])];
        let predicted = vec![seq(&["B-PS"])];
        assert!(matches!(
            evaluate(&gold, &predicted).unwrap_err(),
            NerError::Metrics(_)
        ));
    }

    #[test]
    fn test_compute_metrics_skips_ignored() {
        let labels = vec![vec![-100, 6, 7, 12, -100]];
        let predictions = vec![vec![3, 6, 7, 12, 0]];
        let report = compute_metrics(&predictions, &labels).unwrap();
        assert!(close(report.f1, 1.0));
        assert_eq!(report.accuracy, 1.0);
    }

    #[test]
    fn test_compute_metrics_rejects_bad_ids() {
        let labels = vec![vec![-100, 6, -100]];
        let predictions = vec![vec![0, 42, 0]];
        assert!(compute_metrics(&predictions, &labels).is_err());
    }
}
