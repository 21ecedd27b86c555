//! Data model: jobs, components, page results and the document report.
//!
//! The JSON shape of [`DocumentReport`] is the on-disk output format, so
//! field names here are part of the public contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One document-processing unit.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub filename: String,
    pub source: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl Job {
    /// Start a job for `source`. The id is a random UUID, so two runs over
    /// the same file never collide.
    pub fn new(source: &Path) -> Self {
        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename,
            source: source.to_path_buf(),
            started_at: Utc::now(),
        }
    }
}

/// Kind of a recognised content element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Text,
    Table,
    Image,
    Header,
    Footer,
}

impl ComponentType {
    pub const ALL: [ComponentType; 5] = [
        ComponentType::Text,
        ComponentType::Table,
        ComponentType::Image,
        ComponentType::Header,
        ComponentType::Footer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Text => "text",
            ComponentType::Table => "table",
            ComponentType::Image => "image",
            ComponentType::Header => "header",
            ComponentType::Footer => "footer",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ComponentType::Text),
            "table" => Ok(ComponentType::Table),
            "image" => Ok(ComponentType::Image),
            "header" => Ok(ComponentType::Header),
            "footer" => Ok(ComponentType::Footer),
            other => Err(other.to_string()),
        }
    }
}

/// `[left, top, right, bottom]` in page pixels at the rasterisation DPI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox(pub [f64; 4]);

impl BoundingBox {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self([left, top, right, bottom])
    }

    /// Coordinates are finite and non-negative, with `left < right` and
    /// `top < bottom`.
    pub fn is_valid(&self) -> bool {
        let [l, t, r, b] = self.0;
        self.0.iter().all(|v| v.is_finite() && *v >= 0.0) && l < r && t < b
    }

    pub fn width(&self) -> f64 {
        self.0[2] - self.0[0]
    }

    pub fn height(&self) -> f64 {
        self.0[3] - self.0[1]
    }

    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }
}

/// One recognised content element on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub component_id: String,
    #[serde(rename = "type")]
    pub kind: ComponentType,
    pub content: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// Components detected on one page, in detection order.
///
/// Build with [`PageResult::new`] or [`PageResult::empty`] so that
/// `component_count` always equals `components.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub page_number: usize,
    pub component_count: usize,
    pub components: Vec<Component>,
}

impl PageResult {
    pub fn new(page_number: usize, components: Vec<Component>) -> Self {
        Self {
            page_number,
            component_count: components.len(),
            components,
        }
    }

    /// Result for a page whose extraction terminally failed.
    pub fn empty(page_number: usize) -> Self {
        Self::new(page_number, Vec::new())
    }

    pub fn is_consistent(&self) -> bool {
        self.component_count == self.components.len()
    }
}

/// Per-type component counts. Every type is always present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatistics {
    pub text: usize,
    pub table: usize,
    pub image: usize,
    pub header: usize,
    pub footer: usize,
}

impl ComponentStatistics {
    pub fn record(&mut self, kind: ComponentType) {
        *self.slot(kind) += 1;
    }

    pub fn get(&self, kind: ComponentType) -> usize {
        match kind {
            ComponentType::Text => self.text,
            ComponentType::Table => self.table,
            ComponentType::Image => self.image,
            ComponentType::Header => self.header,
            ComponentType::Footer => self.footer,
        }
    }

    pub fn total(&self) -> usize {
        ComponentType::ALL.iter().map(|k| self.get(*k)).sum()
    }

    /// Add another set of counts into this one.
    pub fn merge(&mut self, other: &ComponentStatistics) {
        for kind in ComponentType::ALL {
            *self.slot(kind) += other.get(kind);
        }
    }

    fn slot(&mut self, kind: ComponentType) -> &mut usize {
        match kind {
            ComponentType::Text => &mut self.text,
            ComponentType::Table => &mut self.table,
            ComponentType::Image => &mut self.image,
            ComponentType::Header => &mut self.header,
            ComponentType::Footer => &mut self.footer,
        }
    }
}

/// Aggregate over every page of one job. This is what gets persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReport {
    pub job_id: String,
    pub filename: String,
    pub compilation_time: DateTime<Utc>,
    pub total_pages: usize,
    pub total_components: usize,
    pub expected_components: usize,
    pub completeness: f64,
    pub component_statistics: ComponentStatistics,
    pub average_confidence: f64,
    pub pages: Vec<PageResult>,
}

impl DocumentReport {
    /// Pages that produced no components (failed or genuinely blank).
    pub fn empty_pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages
            .iter()
            .filter(|p| p.component_count == 0)
            .map(|p| p.page_number)
    }
}
