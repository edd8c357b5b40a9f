use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of one annotation job, extracted from the navigation path.
///
/// All persisted count tables are namespaced by this pair; the string
/// form `{task_id}/{job_id}` is the namespace literal used in store keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobContext {
    pub task_id: u64,
    pub job_id: u64,
}

impl JobContext {
    pub fn new(task_id: u64, job_id: u64) -> Self {
        Self { task_id, job_id }
    }

    pub fn namespace(&self) -> String {
        format!("{}/{}", self.task_id, self.job_id)
    }

    /// Store key of the primary (report-sourced) count table.
    pub fn primary_key(&self) -> String {
        format!("{}_frameCounts", self.namespace())
    }

    /// Store key of the overflow count table.
    pub fn overflow_key(&self) -> String {
        format!("new_{}_frameCounts", self.namespace())
    }

    /// Store key of one track's visited-frame set.
    pub fn frames_key(&self, client_id: u64) -> String {
        format!("{}_{}_frames", client_id, self.namespace())
    }

    /// Store key of the report digest metadata for this namespace.
    pub fn report_meta_key(&self) -> String {
        format!("{}_reportMeta", self.namespace())
    }

    /// Name of the per-task count report.
    pub fn task_report_name(&self) -> String {
        format!("T_{}.txt", self.task_id)
    }

    /// Name of the per-job fallback report.
    pub fn job_report_name(&self) -> String {
        format!("J_{}.txt", self.job_id)
    }
}

impl fmt::Display for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.job_id)
    }
}

/// Extract the job identity from a location path of form
/// `/tasks/{taskID}/jobs/{jobID}`. Returns `None` when the path does not
/// carry both ids; callers treat that as "subsystem disabled for this
/// render," not as an error.
pub fn parse_job_path(path: &str) -> Option<JobContext> {
    let pattern = Regex::new(r"/tasks/(\d+)/jobs/(\d+)").expect("valid regex");
    let captures = pattern.captures(path)?;
    let task_id = captures.get(1)?.as_str().parse().ok()?;
    let job_id = captures.get(2)?.as_str().parse().ok()?;
    Some(JobContext { task_id, job_id })
}

/// One `(client_id, count)` pair. Persisted as a two-element JSON array
/// so stored tables stay lists of pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct CountEntry {
    pub client_id: u64,
    pub count: u64,
}

impl CountEntry {
    pub fn new(client_id: u64, count: u64) -> Self {
        Self { client_id, count }
    }
}

impl From<(u64, u64)> for CountEntry {
    fn from((client_id, count): (u64, u64)) -> Self {
        Self { client_id, count }
    }
}

impl From<CountEntry> for (u64, u64) {
    fn from(entry: CountEntry) -> (u64, u64) {
        (entry.client_id, entry.count)
    }
}

/// Read-only snapshot of one annotated track as the data layer hands it
/// to the render pass. Field names follow the annotation layer's JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackObject {
    #[serde(rename = "clientID")]
    pub client_id: u64,
    pub frame: u64,
    #[serde(default, rename = "zOrder", skip_serializing_if = "Option::is_none")]
    pub z_order: Option<i64>,
}

/// Active ordering mode of the object list. Layer markers are only
/// produced under `ZOrder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatesOrdering {
    IdAscent,
    IdDescent,
    UpdatedTime,
    ZOrder,
}

impl StatesOrdering {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatesOrdering::IdAscent => "id-ascent",
            StatesOrdering::IdDescent => "id-descent",
            StatesOrdering::UpdatedTime => "updated-time",
            StatesOrdering::ZOrder => "z-order",
        }
    }

    pub fn is_z_order(&self) -> bool {
        matches!(self, StatesOrdering::ZOrder)
    }
}

impl fmt::Display for StatesOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatesOrdering {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "id-ascent" | "id_ascent" => Ok(StatesOrdering::IdAscent),
            "id-descent" | "id_descent" => Ok(StatesOrdering::IdDescent),
            "updated-time" | "updated_time" | "updated" => Ok(StatesOrdering::UpdatedTime),
            "z-order" | "z_order" | "zorder" => Ok(StatesOrdering::ZOrder),
            other => Err(format!("Unknown ordering: {other}")),
        }
    }
}

/// One item of the final render sequence consumed by the object list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RenderItem {
    /// Layer boundary marker, displayed as `Layer {z_order}` before the
    /// first object of each run sharing an effective z-order.
    LayerMark { z_order: i64 },
    /// One track row. `frame_count` is `None` when neither table
    /// resolves the id (counts unknown, no synthetic zero).
    Track {
        client_id: u64,
        frame_count: Option<u64>,
    },
}

impl fmt::Display for RenderItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderItem::LayerMark { z_order } => write!(f, "Layer {z_order}"),
            RenderItem::Track {
                client_id,
                frame_count: Some(count),
            } => write!(f, "#{client_id} ({count} frames)"),
            RenderItem::Track {
                client_id,
                frame_count: None,
            } => write!(f, "#{client_id} (frames unknown)"),
        }
    }
}
