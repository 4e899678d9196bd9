//! Partitioned record processing
//!
//! A batch is split into contiguous partitions, one tokio task each. Within a
//! partition records are processed in order; across partitions there is no
//! ordering. Results come back in record order.

use std::future::Future;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::compile::CompiledJob;
use super::error::PipelineError;
use crate::domain::Record;
use crate::threshold::{Decision, ErrorThresholdManager};
use crate::transform::TransformationEngine;
use crate::validation::{FieldValidationResult, ValidationEngine};

/// Fixed-size pool of partition workers
#[derive(Debug, Clone, Copy)]
pub struct PartitionPool {
    workers: usize,
}

impl PartitionPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// One worker per available CPU
    pub fn with_available_parallelism() -> Self {
        Self::new(std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Contiguous, non-empty ranges covering `0..len`
    pub fn partitions(&self, len: usize) -> Vec<Range<usize>> {
        if len == 0 {
            return Vec::new();
        }
        let size = len.div_ceil(self.workers);
        (0..len).step_by(size).map(|start| start..(start + size).min(len)).collect()
    }

    /// Run `work` on every partition concurrently and concatenate the results
    pub async fn run<T, F, Fut>(&self, len: usize, work: F) -> Result<Vec<T>, PipelineError>
    where
        F: Fn(Range<usize>) -> Fut,
        Fut: Future<Output = Vec<T>> + Send + 'static,
        T: Send + 'static,
    {
        let partitions = self.partitions(len);
        debug!(len, partitions = partitions.len(), "PartitionPool::run: called");
        let handles: Vec<_> = partitions.into_iter().map(|range| tokio::spawn(work(range))).collect();

        let mut results = Vec::with_capacity(len);
        for joined in join_all(handles).await {
            results.extend(joined.map_err(|e| PipelineError::Task(e.to_string()))?);
        }
        Ok(results)
    }
}

/// Where a record ended up after both phases
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Never evaluated; processing stopped first
    Skipped,
    /// At least one error-severity failure
    Rejected { failures: Vec<FieldValidationResult> },
    /// Transformed; `failures` holds warnings only
    Accepted {
        record: Record,
        failures: Vec<FieldValidationResult>,
    },
}

impl RecordOutcome {
    fn from_failures(record: Option<Record>, failures: Vec<FieldValidationResult>) -> Self {
        match record {
            Some(record) if !failures.iter().any(FieldValidationResult::is_error) => Self::Accepted { record, failures },
            _ => Self::Rejected { failures },
        }
    }

    pub fn failures(&self) -> &[FieldValidationResult] {
        match self {
            Self::Skipped => &[],
            Self::Rejected { failures } | Self::Accepted { failures, .. } => failures,
        }
    }
}

/// Everything a partition task needs, cheap to clone
#[derive(Clone)]
pub(crate) struct PhaseWorker {
    pub job: Arc<CompiledJob>,
    pub records: Arc<Vec<Record>>,
    pub validation: ValidationEngine,
    pub transform: TransformationEngine,
    pub threshold: Arc<ErrorThresholdManager>,
    pub cancel: CancellationToken,
}

impl PhaseWorker {
    /// Stop or a pending batch retry ends the phase; the current record finishes
    fn halted(&self) -> bool {
        self.cancel.is_cancelled()
            || matches!(
                self.threshold.decision(),
                Decision::Stop | Decision::RetryScheduled { .. }
            )
    }

    fn count(&self, failures: &[FieldValidationResult]) {
        for failure in failures {
            self.threshold.record_outcome(failure.severity);
        }
    }

    /// Pre-stage rules over source records; `None` for records not evaluated
    pub async fn validate(&self, range: Range<usize>) -> Vec<Option<Vec<FieldValidationResult>>> {
        let mut results = Vec::with_capacity(range.len());
        for index in range {
            if self.halted() {
                results.push(None);
                continue;
            }
            let failures: Vec<_> = self
                .validation
                .validate(&self.records[index], &self.job.pre_rules)
                .await
                .into_iter()
                .filter(|result| !result.passed)
                .collect();
            self.count(&failures);
            results.push(Some(failures));
        }
        results
    }

    /// Transform and run post-stage rules on records that passed pre-stage
    pub async fn transform(
        &self,
        range: Range<usize>,
        pre: &[Option<Vec<FieldValidationResult>>],
    ) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::with_capacity(range.len());
        for index in range {
            let Some(mut failures) = pre[index].clone() else {
                outcomes.push(RecordOutcome::Skipped);
                continue;
            };
            if failures.iter().any(FieldValidationResult::is_error) {
                outcomes.push(RecordOutcome::Rejected { failures });
                continue;
            }
            if self.halted() {
                outcomes.push(RecordOutcome::Skipped);
                continue;
            }

            let (record, errors) = self.transform.transform(&self.job.mappings, &self.records[index]).await;
            let mut fresh: Vec<FieldValidationResult> =
                errors.iter().map(FieldValidationResult::from_transformation).collect();
            fresh.extend(
                self.validation
                    .validate(&record, &self.job.post_rules)
                    .await
                    .into_iter()
                    .filter(|result| !result.passed),
            );
            self.count(&fresh);
            failures.extend(fresh);
            outcomes.push(RecordOutcome::from_failures(Some(record), failures));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobConfiguration, Severity, ThresholdPolicy};
    use crate::providers::{ReferenceData, StaticReferenceData};
    use crate::transform::LookupCache;
    use crate::validation::{BusinessRuleRegistry, ValidationContext};
    use std::time::Duration;

    #[test]
    fn test_partitions_cover_range() {
        let pool = PartitionPool::new(4);
        assert_eq!(pool.partitions(10), vec![0..3, 3..6, 6..9, 9..10]);
        assert_eq!(pool.partitions(2), vec![0..1, 1..2]);
        assert!(pool.partitions(0).is_empty());
        assert_eq!(PartitionPool::new(0).workers(), 1);
    }

    #[tokio::test]
    async fn test_run_preserves_order() {
        let pool = PartitionPool::new(3);
        let out = pool
            .run(7, |range| async move { range.map(|i| i * 10).collect::<Vec<_>>() })
            .await
            .unwrap();
        assert_eq!(out, vec![0, 10, 20, 30, 40, 50, 60]);
    }

    fn worker(policy: ThresholdPolicy, records: Vec<Record>) -> PhaseWorker {
        let job = JobConfiguration::from_yaml(
            r#"
job-id: people
target: { table: PEOPLE }
mappings:
  - target: full_name
    rule: { kind: composite, source-fields: [first, last], delimiter: " " }
  - target: emp_status
    rule:
      kind: conditional
      branches:
        - { when: "status == 'A'", then: ACTIVE }
      else-value: INACTIVE
validations:
  - fields: [first]
    rule: { kind: required }
  - fields: [emp_status]
    stage: post
    severity: warning
    rule: { kind: pattern, pattern: "^ACTIVE$" }
"#,
        )
        .unwrap()
        .compile(&BusinessRuleRegistry::default())
        .unwrap();
        let provider = Arc::new(StaticReferenceData::new(ReferenceData::default()));
        PhaseWorker {
            job: Arc::new(job),
            records: Arc::new(records),
            validation: ValidationEngine::new(Arc::new(ValidationContext::new(
                provider.clone(),
                Duration::from_secs(60),
            ))),
            transform: TransformationEngine::new(provider, Arc::new(LookupCache::default())),
            threshold: Arc::new(ErrorThresholdManager::new(policy)),
            cancel: CancellationToken::new(),
        }
    }

    fn person(line: u64, first: &str, status: &str) -> Record {
        Record::from_pairs(line, [("first", first), ("last", "Doe"), ("status", status)])
    }

    #[tokio::test]
    async fn test_phases_classify_records() {
        let w = worker(
            ThresholdPolicy::default(),
            vec![person(1, "Jane", "A"), person(2, "", "A"), person(3, "John", "T")],
        );
        w.threshold.record_processed(3);
        let pre = w.validate(0..3).await;
        assert_eq!(pre[1].as_ref().map(Vec::len), Some(1));
        let outcomes = w.transform(0..3, &pre).await;

        match &outcomes[0] {
            RecordOutcome::Accepted { record, failures } => {
                assert_eq!(record.get("full_name"), Some("Jane Doe"));
                assert_eq!(record.get("emp_status"), Some("ACTIVE"));
                assert!(failures.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(outcomes[1], RecordOutcome::Rejected { .. }));
        match &outcomes[2] {
            RecordOutcome::Accepted { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].severity, Severity::Warning);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(w.threshold.counters().errors(), 1);
        assert_eq!(w.threshold.counters().warnings(), 1);
    }

    #[tokio::test]
    async fn test_stop_halts_remaining_records() {
        let policy = ThresholdPolicy {
            max_errors: Some(1),
            ..ThresholdPolicy::default()
        };
        let w = worker(policy, vec![person(1, "", "A"), person(2, "Jane", "A"), person(3, "", "A")]);
        w.threshold.record_processed(3);
        let pre = w.validate(0..3).await;
        assert!(pre[0].is_some());
        assert!(pre[1].is_none());
        assert!(pre[2].is_none());

        let outcomes = w.transform(0..3, &pre).await;
        assert!(matches!(outcomes[0], RecordOutcome::Rejected { .. }));
        assert_eq!(outcomes[1], RecordOutcome::Skipped);
        assert_eq!(w.threshold.counters().errors(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_worker_skips_everything() {
        let w = worker(ThresholdPolicy::default(), vec![person(1, "Jane", "A")]);
        w.cancel.cancel();
        assert_eq!(w.validate(0..1).await, vec![None]);
    }
}
