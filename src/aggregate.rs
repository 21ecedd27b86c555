//! Document-level aggregation of per-page results.
//!
//! [`aggregate`] is a pure fold: it runs once, after every page of a job has
//! either produced components or terminally failed, and never touches the
//! network or the file system.

use crate::model::{ComponentStatistics, DocumentReport, Job, PageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Policy for the completeness denominator.
///
/// The expected count is a heuristic baseline, not a requirement; it only
/// scales `completeness`.
pub trait ExpectationPolicy: Send + Sync + fmt::Debug {
    fn expected_components(&self, pages: &[PageResult]) -> usize;
}

/// A fixed number of components per page. Default: 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerPageBaseline {
    pub per_page: usize,
}

impl Default for PerPageBaseline {
    fn default() -> Self {
        Self { per_page: 8 }
    }
}

impl ExpectationPolicy for PerPageBaseline {
    fn expected_components(&self, pages: &[PageResult]) -> usize {
        self.per_page.saturating_mul(pages.len())
    }
}

/// The same target regardless of page count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTarget(pub usize);

impl ExpectationPolicy for FixedTarget {
    fn expected_components(&self, _pages: &[PageResult]) -> usize {
        self.0
    }
}

/// Fold page results into a document report.
///
/// `pages` must hold one entry per page, failed pages included (as empty
/// results). Order does not matter; the report lists pages ascending.
pub fn aggregate(
    job: &Job,
    mut pages: Vec<PageResult>,
    policy: &dyn ExpectationPolicy,
) -> DocumentReport {
    pages.sort_by_key(|p| p.page_number);

    let mut statistics = ComponentStatistics::default();
    let mut confidence_sum = 0.0;
    let mut total_components = 0usize;

    for page in &pages {
        total_components += page.component_count;
        for component in &page.components {
            statistics.record(component.kind);
            confidence_sum += component.confidence;
        }
    }

    let average_confidence = if total_components == 0 {
        0.0
    } else {
        confidence_sum / total_components as f64
    };

    let expected_components = policy.expected_components(&pages);

    DocumentReport {
        job_id: job.id.clone(),
        filename: job.filename.clone(),
        compilation_time: Utc::now(),
        total_pages: pages.len(),
        total_components,
        expected_components,
        completeness: completeness(total_components, expected_components),
        component_statistics: statistics,
        average_confidence,
        pages,
    }
}

/// `total / expected`, clamped to [0, 1]; 0 when nothing is expected.
pub fn completeness(total: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    (total as f64 / expected as f64).clamp(0.0, 1.0)
}

/// Roll-up over every report produced in a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_documents: usize,
    pub total_pages: usize,
    pub total_components: usize,
    /// Mean of per-document average confidence.
    pub average_confidence: f64,
    /// Mean of per-document completeness.
    pub average_completeness: f64,
    pub component_breakdown: ComponentStatistics,
    /// When the summary was computed.
    pub processing_time: DateTime<Utc>,
}

pub fn summarize<'a>(reports: impl IntoIterator<Item = &'a DocumentReport>) -> BatchSummary {
    let mut summary = BatchSummary {
        processing_time: Utc::now(),
        ..BatchSummary::default()
    };
    let mut confidence = 0.0;
    let mut completeness = 0.0;

    for report in reports {
        summary.total_documents += 1;
        summary.total_pages += report.total_pages;
        summary.total_components += report.total_components;
        summary
            .component_breakdown
            .merge(&report.component_statistics);
        confidence += report.average_confidence;
        completeness += report.completeness;
    }

    if summary.total_documents > 0 {
        let n = summary.total_documents as f64;
        summary.average_confidence = confidence / n;
        summary.average_completeness = completeness / n;
    }
    summary
}
