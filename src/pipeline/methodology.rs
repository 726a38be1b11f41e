//! Methodology → Stage Mapping
//!
//! Stage order is a lookup table keyed by a methodology enum, decided once at
//! pipeline construction. Adding a methodology means adding a list here, not
//! modifying pipeline control flow.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::QualError;

use super::stage::PipelineStage;
use super::stages::{
    AxialCodingStage, ConstantComparisonStage, OpenCodingStage, SegmentationStage,
    SelectiveCodingStage,
};

// =============================================================================
// Stage Kinds
// =============================================================================

/// Identifier for each known stage implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Segmentation,
    OpenCoding,
    AxialCoding,
    SelectiveCoding,
    ConstantComparison,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::OpenCoding => "open_coding",
            Self::AxialCoding => "axial_coding",
            Self::SelectiveCoding => "selective_coding",
            Self::ConstantComparison => "constant_comparison",
        }
    }

    /// Instantiate the stage implementation.
    pub fn build(&self) -> Box<dyn PipelineStage> {
        match self {
            Self::Segmentation => Box::new(SegmentationStage::default()),
            Self::OpenCoding => Box::new(OpenCodingStage),
            Self::AxialCoding => Box::new(AxialCodingStage),
            Self::SelectiveCoding => Box::new(SelectiveCodingStage),
            Self::ConstantComparison => Box::new(ConstantComparisonStage::default()),
        }
    }
}

// =============================================================================
// Methodology
// =============================================================================

/// Analysis methodology; determines the ordered stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Methodology {
    /// Open → axial → selective coding.
    GroundedTheory,
    /// Segmentation → open coding → theme grouping (with review).
    ThematicAnalysis,
    /// Incremental segment-by-segment coding with saturation halt.
    ConstantComparison,
}

impl Methodology {
    /// The ordered stage list for this methodology.
    pub fn stage_sequence(&self) -> &'static [StageKind] {
        match self {
            Self::GroundedTheory => &[
                StageKind::Segmentation,
                StageKind::OpenCoding,
                StageKind::AxialCoding,
                StageKind::SelectiveCoding,
            ],
            Self::ThematicAnalysis => &[
                StageKind::Segmentation,
                StageKind::OpenCoding,
                StageKind::AxialCoding,
            ],
            Self::ConstantComparison => &[
                StageKind::Segmentation,
                StageKind::ConstantComparison,
            ],
        }
    }
}

impl fmt::Display for Methodology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GroundedTheory => "grounded-theory",
            Self::ThematicAnalysis => "thematic-analysis",
            Self::ConstantComparison => "constant-comparison",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Methodology {
    type Err = QualError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "grounded-theory" | "grounded" => Ok(Self::GroundedTheory),
            "thematic-analysis" | "thematic" => Ok(Self::ThematicAnalysis),
            "constant-comparison" | "incremental" => Ok(Self::ConstantComparison),
            other => Err(QualError::Config(format!(
                "unknown methodology '{}' (expected grounded-theory, thematic-analysis, or constant-comparison)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sequences_start_with_segmentation() {
        for m in [
            Methodology::GroundedTheory,
            Methodology::ThematicAnalysis,
            Methodology::ConstantComparison,
        ] {
            assert_eq!(m.stage_sequence()[0], StageKind::Segmentation);
            assert!(!m.stage_sequence().is_empty());
        }
    }

    #[test]
    fn test_grounded_theory_order() {
        let names: Vec<_> = Methodology::GroundedTheory
            .stage_sequence()
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(
            names,
            vec!["segmentation", "open_coding", "axial_coding", "selective_coding"]
        );
    }

    #[test]
    fn test_parse_methodology() {
        assert_eq!(
            "grounded-theory".parse::<Methodology>().unwrap(),
            Methodology::GroundedTheory
        );
        assert_eq!(
            "Thematic_Analysis".parse::<Methodology>().unwrap(),
            Methodology::ThematicAnalysis
        );
        assert!("mystery".parse::<Methodology>().is_err());
    }
}
