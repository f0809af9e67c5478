//! A/B Tests
//!
//! Variant experiments on a subject and the deterministic winner rule:
//! each variant scores the sum of its declared metrics, `conversion`
//! counting double. The strictly highest score wins; ties go to the
//! variant declared first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::services::Metrics;
use crate::store::{Document, AB_TESTS};

/// Metric that weighs double in the score.
pub const CONVERSION: &str = "conversion";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Variant {
    pub id: String,
    /// Field overrides this variant applies to the subject
    #[serde(default)]
    pub changes: Value,
}

impl Variant {
    pub fn new(id: impl Into<String>, changes: Value) -> Self {
        Self {
            id: id.into(),
            changes,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ABTestStatus {
    Running,
    Completed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VariantScore {
    pub variant_id: String,
    pub metrics: Metrics,
    pub score: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ABTestResults {
    pub winner: String,
    /// Percent over the runner-up; `None` when the runner-up scored zero
    pub improvement: Option<f64>,
    /// In declaration order
    pub scores: Vec<VariantScore>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ABTest {
    pub id: String,
    pub subject_id: String,
    pub variants: Vec<Variant>,
    pub metrics: Vec<String>,
    pub duration_seconds: u64,
    pub status: ABTestStatus,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ABTestResults>,
}

impl ABTest {
    pub fn new(
        subject_id: impl Into<String>,
        variants: Vec<Variant>,
        metrics: Vec<String>,
        duration_seconds: u64,
        started_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            variants,
            metrics,
            duration_seconds,
            status: ABTestStatus::Running,
            started_by: started_by.into(),
            started_at: Utc::now(),
            completed_at: None,
            results: None,
        }
    }

    /// Earliest moment the test may complete.
    pub fn due_at(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.duration_seconds)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        self.started_at
            .checked_add_signed(Duration::seconds(secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.due_at()
    }

    pub fn is_running(&self) -> bool {
        self.status == ABTestStatus::Running
    }

    /// Records the results and completes the test.
    pub fn complete(&mut self, results: ABTestResults, now: DateTime<Utc>) {
        self.status = ABTestStatus::Completed;
        self.completed_at = Some(now);
        self.results = Some(results);
    }
}

impl Document for ABTest {
    const COLLECTION: &'static str = AB_TESTS;

    fn id(&self) -> &str {
        &self.id
    }
}

pub fn metric_weight(metric: &str) -> f64 {
    if metric == CONVERSION {
        2.0
    } else {
        1.0
    }
}

/// Weighted sum of the declared metrics; missing metrics count as zero.
pub fn score(metrics: &Metrics, declared: &[String]) -> f64 {
    declared
        .iter()
        .map(|name| metrics.get(name).copied().unwrap_or(0.0) * metric_weight(name))
        .sum()
}

/// Picks the winner among `(variant_id, metrics)` pairs given in
/// declaration order. Returns `None` for an empty list.
pub fn select_winner(variants: &[(String, Metrics)], declared: &[String]) -> Option<ABTestResults> {
    let scores: Vec<VariantScore> = variants
        .iter()
        .map(|(id, metrics)| VariantScore {
            variant_id: id.clone(),
            metrics: metrics.clone(),
            score: score(metrics, declared),
        })
        .collect();

    let mut winner = 0;
    for (index, candidate) in scores.iter().enumerate().skip(1) {
        if candidate.score > scores[winner].score {
            winner = index;
        }
    }
    let winner_score = scores.get(winner)?.score;

    let runner_up = scores
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != winner)
        .map(|(_, s)| s.score)
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));

    let improvement = match runner_up {
        None => Some(0.0),
        Some(r) if r == 0.0 => None,
        Some(r) => Some((winner_score - r) / r * 100.0),
    };

    Some(ABTestResults {
        winner: scores[winner].variant_id.clone(),
        improvement,
        scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn declared(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_conversion_weighs_double() {
        let m = metrics(&[("conversion", 3.0), ("clicks", 4.0), ("ignored", 100.0)]);
        assert_eq!(score(&m, &declared(&["conversion", "clicks"])), 10.0);
    }

    #[test]
    fn test_winner_and_improvement() {
        let variants = vec![
            ("A".to_string(), metrics(&[("conversion", 10.0)])),
            ("B".to_string(), metrics(&[("conversion", 8.0)])),
        ];
        let results = select_winner(&variants, &declared(&["conversion"])).unwrap();

        assert_eq!(results.winner, "A");
        assert_eq!(results.improvement, Some(25.0));
        assert_eq!(results.scores[1].score, 16.0);
    }

    #[test]
    fn test_tie_goes_to_first_declared() {
        let variants = vec![
            ("A".to_string(), metrics(&[("clicks", 5.0)])),
            ("B".to_string(), metrics(&[("clicks", 5.0)])),
        ];
        let results = select_winner(&variants, &declared(&["clicks"])).unwrap();

        assert_eq!(results.winner, "A");
        assert_eq!(results.improvement, Some(0.0));
    }

    #[test]
    fn test_later_variant_must_be_strictly_better() {
        let variants = vec![
            ("A".to_string(), metrics(&[("clicks", 5.0)])),
            ("B".to_string(), metrics(&[("clicks", 9.0)])),
            ("C".to_string(), metrics(&[("clicks", 9.0)])),
        ];
        let results = select_winner(&variants, &declared(&["clicks"])).unwrap();

        assert_eq!(results.winner, "B");
        assert_eq!(results.improvement, Some(0.0));
    }

    #[test]
    fn test_negative_improvement_is_not_clamped() {
        let variants = vec![
            ("A".to_string(), metrics(&[("revenue", -1.0)])),
            ("B".to_string(), metrics(&[("revenue", -2.0)])),
        ];
        let results = select_winner(&variants, &declared(&["revenue"])).unwrap();

        assert_eq!(results.winner, "A");
        assert_eq!(results.improvement, Some(-50.0));
    }

    #[test]
    fn test_edge_cases() {
        assert!(select_winner(&[], &declared(&["clicks"])).is_none());

        let single = vec![("only".to_string(), metrics(&[("clicks", 3.0)]))];
        let results = select_winner(&single, &declared(&["clicks"])).unwrap();
        assert_eq!(results.winner, "only");
        assert_eq!(results.improvement, Some(0.0));

        let zero_runner_up = vec![
            ("A".to_string(), metrics(&[("clicks", 3.0)])),
            ("B".to_string(), Metrics::new()),
        ];
        let results = select_winner(&zero_runner_up, &declared(&["clicks"])).unwrap();
        assert_eq!(results.improvement, None);
    }

    #[test]
    fn test_due_time() {
        let test = ABTest::new("post-1", vec![], declared(&["clicks"]), 60, "ana");
        assert!(!test.is_due(test.started_at));
        assert!(test.is_due(test.started_at + Duration::seconds(60)));
    }
}
