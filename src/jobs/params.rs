//! Separation parameters attached to a job at submission time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParamsError;

/// Default number of random shifts applied by the engine.
pub const DEFAULT_SHIFTS: u32 = 1;

/// Default overlap between processing chunks.
pub const DEFAULT_OVERLAP: f64 = 0.25;

/// Maximum accepted number of shifts.
pub const MAX_SHIFTS: u32 = 10;

/// Accepted overlap range, inclusive.
pub const OVERLAP_RANGE: std::ops::RangeInclusive<f64> = 0.1..=0.9;

/// Separation model variants understood by the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SeparationModel {
    /// Hybrid transformer demucs, 4 stems.
    #[default]
    #[serde(rename = "htdemucs")]
    Htdemucs,
    /// Fine-tuned hybrid transformer demucs, 4 stems.
    #[serde(rename = "htdemucs_ft")]
    HtdemucsFt,
    /// Six-stem hybrid transformer demucs (adds guitar and piano).
    #[serde(rename = "htdemucs_6s")]
    Htdemucs6s,
    /// MDX challenge model, 4 stems.
    #[serde(rename = "mdx_extra")]
    MdxExtra,
}

const FOUR_STEMS: &[&str] = &["drums", "bass", "other", "vocals"];
const SIX_STEMS: &[&str] = &["drums", "bass", "other", "vocals", "guitar", "piano"];

impl SeparationModel {
    pub const ALL: [SeparationModel; 4] = [
        SeparationModel::Htdemucs,
        SeparationModel::HtdemucsFt,
        SeparationModel::Htdemucs6s,
        SeparationModel::MdxExtra,
    ];

    /// Returns the model name as passed to the engine.
    pub fn as_str(&self) -> &'static str {
        match self {
            SeparationModel::Htdemucs => "htdemucs",
            SeparationModel::HtdemucsFt => "htdemucs_ft",
            SeparationModel::Htdemucs6s => "htdemucs_6s",
            SeparationModel::MdxExtra => "mdx_extra",
        }
    }

    /// Stem names the model produces, in output order.
    pub fn stems(&self) -> &'static [&'static str] {
        match self {
            SeparationModel::Htdemucs6s => SIX_STEMS,
            _ => FOUR_STEMS,
        }
    }
}

impl fmt::Display for SeparationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeparationModel {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        SeparationModel::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == name)
            .ok_or_else(|| ParamsError::UnknownModel(s.to_string()))
    }
}

/// Processing parameters for a job.
///
/// Every option has a default so a submission without parameters is valid.
/// Values are checked once by [`JobParams::validate`] before the job is
/// created and never change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParams {
    pub model: SeparationModel,
    pub shifts: u32,
    pub overlap: f64,
    pub split: bool,
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            model: SeparationModel::default(),
            shifts: DEFAULT_SHIFTS,
            overlap: DEFAULT_OVERLAP,
            split: true,
        }
    }
}

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: SeparationModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_shifts(mut self, shifts: u32) -> Self {
        self.shifts = shifts;
        self
    }

    pub fn with_overlap(mut self, overlap: f64) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_split(mut self, split: bool) -> Self {
        self.split = split;
        self
    }

    /// Checks every option against its accepted range.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.shifts > MAX_SHIFTS {
            return Err(ParamsError::InvalidShifts(self.shifts));
        }
        if !OVERLAP_RANGE.contains(&self.overlap) {
            return Err(ParamsError::InvalidOverlap(self.overlap));
        }
        Ok(())
    }
}
