pub mod errors;

pub use errors::{ErrorCategory, PipelineError, PipelineResult};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    #[default]
    Serial,
    Parallel(usize),
}

impl ExecutionMode {
    pub fn from_workers(workers: usize) -> Self {
        if workers <= 1 {
            Self::Serial
        } else {
            Self::Parallel(workers)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Average,
    Combine,
    Sum,
    Scale,
    Noise,
    Resample,
    Postprocess,
    Attenuation,
    Quantify,
}

impl PipelineStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Combine => "COMBINE",
            Self::Sum => "SUM",
            Self::Scale => "SCALE",
            Self::Noise => "NOISE",
            Self::Resample => "RESAMPLE",
            Self::Postprocess => "POSTPROCESS",
            Self::Attenuation => "ATTENUATION",
            Self::Quantify => "QUANTIFY",
        }
    }
}

impl Display for PipelineStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Single-precision sample array with an explicit shape, slowest axis first.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Volume {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> PipelineResult<Self> {
        check_shape(&shape, data.len())?;
        Ok(Self { shape, data })
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_wide(&self) -> WideVolume {
        WideVolume {
            shape: self.shape.clone(),
            data: self.data.iter().map(|value| f64::from(*value)).collect(),
        }
    }

    pub fn into_parts(self) -> (Vec<usize>, Vec<f32>) {
        (self.shape, self.data)
    }
}

/// Double-precision counterpart of [`Volume`] used while accumulating and
/// scaling. Converted back to `f32` only when persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct WideVolume {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl WideVolume {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> PipelineResult<Self> {
        check_shape(&shape, data.len())?;
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn to_single(&self) -> Volume {
        Volume {
            shape: self.shape.clone(),
            data: self.data.iter().map(|value| *value as f32).collect(),
        }
    }
}

fn check_shape(shape: &[usize], len: usize) -> PipelineResult<()> {
    let expected: usize = shape.iter().product();
    if shape.is_empty() || expected != len {
        return Err(PipelineError::internal(
            "SYS.VOLUME_SHAPE",
            format!(
                "shape {:?} describes {} samples but {} were supplied",
                shape, expected, len
            ),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderAttribute {
    pub name: String,
    pub value: String,
}

impl HeaderAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered key/value metadata bound to a volume but stored apart from it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub attributes: Vec<HeaderAttribute>,
}

impl Header {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .map(|attribute| attribute.value.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .attributes
            .iter_mut()
            .find(|attribute| attribute.name == name)
        {
            Some(existing) => existing.value = value,
            None => self.attributes.push(HeaderAttribute::new(name, value)),
        }
    }

    /// Copies every attribute of `source`, overwriting same-named ones.
    pub fn overwrite_from(&mut self, source: &Header) {
        for attribute in &source.attributes {
            self.set(&attribute.name, attribute.value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceTag {
    pub radionuclide: String,
    pub voi: String,
}

impl Display for SourceTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.radionuclide, self.voi)
    }
}

/// Unit of independent work for the driver.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IndexTuple {
    pub window: Option<u8>,
    pub source: Option<SourceTag>,
}

impl IndexTuple {
    pub fn window(window: u8) -> Self {
        Self {
            window: Some(window),
            source: None,
        }
    }

    pub fn window_text(&self) -> Option<String> {
        self.window.map(|window| format!("{:02}", window))
    }
}

impl Display for IndexTuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.window, &self.source) {
            (Some(window), Some(source)) => write!(f, "w{:02}/{}", window, source),
            (Some(window), None) => write!(f, "w{:02}", window),
            (None, Some(source)) => write!(f, "{}", source),
            (None, None) => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    Written(Vec<PathBuf>),
    Skipped(String),
    Insufficient { count: usize },
    Abandoned(PipelineError),
}

/// Contributions an averaging group accepted and turned away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContributionCounts {
    pub count: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub group: String,
    pub outcome: GroupOutcome,
    /// Set only by stages that accumulate contributions.
    pub contributions: Option<ContributionCounts>,
}

impl GroupReport {
    pub fn new(group: impl Into<String>, outcome: GroupOutcome) -> Self {
        Self {
            group: group.into(),
            outcome,
            contributions: None,
        }
    }

    pub fn with_contributions(mut self, contributions: Option<ContributionCounts>) -> Self {
        self.contributions = contributions;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: PipelineStage,
    pub groups: Vec<GroupReport>,
}

impl StageReport {
    pub fn new(stage: PipelineStage) -> Self {
        Self {
            stage,
            groups: Vec::new(),
        }
    }

    pub fn push(&mut self, report: GroupReport) {
        self.groups.push(report);
    }

    pub fn written(&self) -> Vec<&PathBuf> {
        self.groups
            .iter()
            .filter_map(|report| match &report.outcome {
                GroupOutcome::Written(paths) => Some(paths.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn skipped_count(&self) -> usize {
        self.count_matching(|outcome| matches!(outcome, GroupOutcome::Skipped(_)))
    }

    pub fn insufficient_count(&self) -> usize {
        self.count_matching(|outcome| matches!(outcome, GroupOutcome::Insufficient { .. }))
    }

    pub fn abandoned(&self) -> Vec<&GroupReport> {
        self.groups
            .iter()
            .filter(|report| matches!(report.outcome, GroupOutcome::Abandoned(_)))
            .collect()
    }

    pub fn has_abandoned(&self) -> bool {
        !self.abandoned().is_empty()
    }

    fn count_matching(&self, predicate: impl Fn(&GroupOutcome) -> bool) -> usize {
        self.groups
            .iter()
            .filter(|report| predicate(&report.outcome))
            .count()
    }
}

pub fn render_human_summary(report: &StageReport) -> String {
    let mut lines = vec![format!(
        "{} status: {} ({} groups, {} outputs written, {} skipped, {} insufficient, {} abandoned)",
        report.stage,
        if report.has_abandoned() { "INCOMPLETE" } else { "OK" },
        report.groups.len(),
        report.written().len(),
        report.skipped_count(),
        report.insufficient_count(),
        report.abandoned().len()
    )];

    for group in &report.groups {
        let line = match &group.outcome {
            GroupOutcome::Written(paths) => {
                let mut line = format!(
                    "  {}: wrote {}",
                    group.group,
                    paths
                        .iter()
                        .map(|path| path.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                if let Some(counts) = group.contributions {
                    line.push_str(&format!(
                        " ({} contribution(s), {} rejected)",
                        counts.count, counts.rejected
                    ));
                }
                line
            }
            GroupOutcome::Skipped(reason) => format!("  {}: skipped ({})", group.group, reason),
            GroupOutcome::Insufficient { count } => format!(
                "  {}: summed {} image(s), not enough to average; no output",
                group.group, count
            ),
            GroupOutcome::Abandoned(error) => {
                format!("  {}: abandoned {}", group.group, error.diagnostic_line())
            }
        };
        lines.push(line);
    }

    lines.join("\n")
}
