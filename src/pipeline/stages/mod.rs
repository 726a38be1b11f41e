//! Stage Implementations
//!
//! Each stage implements [`super::stage::PipelineStage`] and is assembled
//! into a run order by the methodology table.

pub mod axial_coding;
pub mod constant_comparison;
pub mod open_coding;
pub mod segmentation;
pub mod selective_coding;

pub use axial_coding::AxialCodingStage;
pub use constant_comparison::ConstantComparisonStage;
pub use open_coding::OpenCodingStage;
pub use segmentation::{
    ParagraphStrategy, SegmentationStage, SegmentationStrategy, SpeakerTurnStrategy,
};
pub use selective_coding::SelectiveCodingStage;
