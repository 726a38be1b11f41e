//! Statistics
//!
//! Quantitative rigor checks over the qualitative coding:
//!
//! - `agreement`: percent agreement, Cohen's kappa, Fleiss' kappa
//! - `reliability`: repeated-pass IRR and stability runs
//! - `saturation`: codebook growth tracking

pub mod agreement;
pub mod reliability;
pub mod saturation;

pub use agreement::{fleiss_kappa, interpretation_band, pair_agreement, CodingPass, Kappa, PairAgreement};
pub use reliability::{ReliabilityEngine, ReliabilityReport, ReportKind};
pub use saturation::{SaturationConfig, SaturationDetector, SaturationSignal};
