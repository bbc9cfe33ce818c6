use super::propagator::{SequencePropagator, SequenceResult};
use crate::error::{EvalError, ModelError};
use crate::segmentation::InferenceAdapter;
use crate::source::SequenceSource;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A sequence dropped from the report because one of its files was unreadable
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSequence {
    pub sequence_id: String,
    pub reason: String,
}

/// Ordered per-sequence results plus the dataset mean
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub sequences: Vec<SequenceResult>,
    pub skipped: Vec<SkippedSequence>,
    /// Mean of per-sequence means; `None` if no sequence was scored
    pub mean_iou: Option<f64>,
}

impl EvaluationReport {
    /// Key of the dataset mean in the flat result record
    pub const TOTAL_KEY: &'static str = "total_miou";

    /// Mean-of-means: every sequence weighs the same regardless of length
    pub fn new(sequences: Vec<SequenceResult>, skipped: Vec<SkippedSequence>) -> Self {
        let means: Vec<f64> = sequences.iter().filter_map(|s| s.mean_iou).collect();
        let mean_iou = (!means.is_empty()).then(|| means.iter().sum::<f64>() / means.len() as f64);
        Self {
            sequences,
            skipped,
            mean_iou,
        }
    }

    pub fn get(&self, sequence_id: &str) -> Option<&SequenceResult> {
        self.sequences.iter().find(|s| s.sequence_id == sequence_id)
    }

    /// Flat record: sequence id to mean IoU, then the dataset mean
    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = Map::new();
        for sequence in &self.sequences {
            record.insert(sequence.sequence_id.clone(), option_to_value(sequence.mean_iou));
        }
        record.insert(Self::TOTAL_KEY.to_string(), option_to_value(self.mean_iou));
        record
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), EvalError> {
        let path = path.as_ref();
        let report_err = |source| EvalError::Report {
            path: path.to_path_buf(),
            source,
        };

        let file = File::create(path).map_err(report_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.to_record())
            .map_err(|e| report_err(e.into()))?;
        writer.flush().map_err(report_err)?;

        tracing::info!("Wrote report to {}", path.display());
        Ok(())
    }
}

fn option_to_value(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::from)
}

/// Runs every sequence and folds the results into a report
pub struct EvaluationAggregator<'a> {
    propagator: SequencePropagator<'a>,
    strict: bool,
    report_path: Option<PathBuf>,
}

impl<'a> EvaluationAggregator<'a> {
    pub fn new(propagator: SequencePropagator<'a>) -> Self {
        Self {
            propagator,
            strict: false,
            report_path: None,
        }
    }

    /// Abort on the first resource error instead of skipping the sequence
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_report_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.report_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Evaluate sequences one at a time with a single model
    pub fn run<S, M>(&self, source: &S, sequence_ids: &[String], model: &mut M) -> Result<EvaluationReport, EvalError>
    where
        S: SequenceSource + ?Sized,
        M: InferenceAdapter + ?Sized,
    {
        let ids = ordered_ids(sequence_ids)?;
        tracing::info!("Evaluating {} sequences", ids.len());

        let mut sequences = Vec::with_capacity(ids.len());
        let mut skipped = Vec::new();
        for id in &ids {
            let outcome = self.propagator.run(source, id, model);
            self.absorb(id, outcome, &mut sequences, &mut skipped)?;
        }

        self.finish(sequences, skipped)
    }

    /// Evaluate sequences on a pool of `workers` threads, one model per worker
    ///
    /// Sequences are pulled from a shared cursor; each worker keeps its own
    /// results, which are merged back in sequence order.
    pub fn run_parallel<S, M, F>(
        &self,
        source: &S,
        sequence_ids: &[String],
        workers: usize,
        mut create_model: F,
    ) -> Result<EvaluationReport, EvalError>
    where
        S: SequenceSource + Sync + ?Sized,
        M: InferenceAdapter + Send,
        F: FnMut() -> Result<M, ModelError>,
    {
        let ids = ordered_ids(sequence_ids)?;
        let workers = workers.clamp(1, ids.len().max(1));
        tracing::info!("Evaluating {} sequences on {} workers", ids.len(), workers);

        let models = (0..workers)
            .map(|worker| {
                create_model().map_err(|source| EvalError::Model {
                    sequence: "-".to_string(),
                    frame: format!("worker {worker}"),
                    source,
                })
            })
            .collect::<Result<Vec<M>, _>>()?;

        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
        let cursor = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);

        let per_worker: Vec<Vec<(usize, Result<SequenceResult, EvalError>)>> = pool.install(|| {
            models
                .into_par_iter()
                .map(|mut model| {
                    let mut done = Vec::new();
                    while !abort.load(Ordering::Relaxed) {
                        let index = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(id) = ids.get(index) else {
                            break;
                        };
                        let outcome = self.propagator.run(source, id, &mut model);
                        if matches!(&outcome, Err(e) if self.is_fatal(e)) {
                            abort.store(true, Ordering::Relaxed);
                        }
                        done.push((index, outcome));
                    }
                    done
                })
                .collect()
        });

        let mut outcomes: Vec<_> = per_worker.into_iter().flatten().collect();
        outcomes.sort_by_key(|(index, _)| *index);

        let mut sequences = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        for (index, outcome) in outcomes {
            self.absorb(&ids[index], outcome, &mut sequences, &mut skipped)?;
        }

        self.finish(sequences, skipped)
    }

    fn is_fatal(&self, error: &EvalError) -> bool {
        self.strict || !error.is_resource()
    }

    fn absorb(
        &self,
        id: &str,
        outcome: Result<SequenceResult, EvalError>,
        sequences: &mut Vec<SequenceResult>,
        skipped: &mut Vec<SkippedSequence>,
    ) -> Result<(), EvalError> {
        match outcome {
            Ok(result) => sequences.push(result),
            Err(error) if !self.is_fatal(&error) => {
                tracing::error!("Skipping sequence {}: {}", id, error);
                skipped.push(SkippedSequence {
                    sequence_id: id.to_string(),
                    reason: error.to_string(),
                });
            }
            Err(error) => return Err(error),
        }
        Ok(())
    }

    fn finish(
        &self,
        sequences: Vec<SequenceResult>,
        skipped: Vec<SkippedSequence>,
    ) -> Result<EvaluationReport, EvalError> {
        let report = EvaluationReport::new(sequences, skipped);
        match report.mean_iou {
            Some(mean) => tracing::info!("Dataset mean IoU {:.4}", mean),
            None => tracing::warn!("No sequence could be scored"),
        }
        if !report.skipped.is_empty() {
            tracing::warn!("{} sequences skipped", report.skipped.len());
        }

        if let Some(path) = &self.report_path {
            report.write_json(path)?;
        }
        Ok(report)
    }
}

/// Lexicographic, duplicate-free; the total key may not be used as an id
fn ordered_ids(sequence_ids: &[String]) -> Result<Vec<String>, EvalError> {
    let mut ids = sequence_ids.to_vec();
    ids.sort();
    ids.dedup();
    if let Some(reserved) = ids.iter().find(|id| id.as_str() == EvaluationReport::TOTAL_KEY) {
        return Err(EvalError::ReservedSequenceId(reserved.clone()));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::FrameScore;

    fn result(id: &str, ious: &[f64]) -> SequenceResult {
        let frames = ious
            .iter()
            .enumerate()
            .map(|(index, &iou)| FrameScore {
                index,
                name: format!("{index:05}"),
                annotated: true,
                iou: Some(iou),
            })
            .collect();
        SequenceResult::new(id, frames)
    }

    #[test]
    fn test_mean_of_means_ignores_frame_counts() {
        let short = result("a", &[0.8; 5]);
        let long = result("b", &[0.4; 50]);
        let report = EvaluationReport::new(vec![short, long], Vec::new());
        assert!((report.mean_iou.unwrap() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_unscored_sequence_excluded_from_mean() {
        let unscored = SequenceResult::new("c", Vec::new());
        let report = EvaluationReport::new(vec![result("a", &[0.5]), unscored], Vec::new());
        assert_eq!(report.mean_iou, Some(0.5));
        assert_eq!(report.to_record()["c"], Value::Null);
    }

    #[test]
    fn test_record_is_flat_and_ordered() {
        let report = EvaluationReport::new(vec![result("a", &[1.0]), result("b", &[0.0])], Vec::new());
        let record = report.to_record();
        let keys: Vec<_> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b", EvaluationReport::TOTAL_KEY]);
        assert_eq!(record[EvaluationReport::TOTAL_KEY], Value::from(0.5));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        EvaluationReport::new(vec![result("bear", &[0.25, 0.75])], Vec::new())
            .write_json(&path)
            .unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["bear"], Value::from(0.5));
        assert_eq!(written[EvaluationReport::TOTAL_KEY], Value::from(0.5));
    }

    #[test]
    fn test_ids_sorted_and_deduplicated() {
        let ids = ordered_ids(&["cows".to_string(), "bear".to_string(), "cows".to_string()]).unwrap();
        assert_eq!(ids, vec!["bear", "cows"]);
        assert!(matches!(
            ordered_ids(&[EvaluationReport::TOTAL_KEY.to_string()]),
            Err(EvalError::ReservedSequenceId(_))
        ));
    }
}
