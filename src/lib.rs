//! QualWeave - LLM-Assisted Qualitative Coding Engine
//!
//! Runs qualitative analysis methodologies (grounded theory, thematic
//! analysis, constant comparison) over interview transcripts: an LLM
//! proposes codes and quote applications, a human reviews them at
//! checkpoints, and the engine measures how trustworthy the coding is.
//!
//! ## Core Features
//!
//! - **Staged Pipeline**: methodology-ordered stages over one shared
//!   `ProjectState`, every mutation an atomic delta
//! - **Versioned Codebook**: append-only code forest; review decisions
//!   advance versions, nothing is hard-deleted
//! - **Human Review**: suspend/resume checkpoints with approve, reject,
//!   modify, merge, and split decisions plus an audit trail
//! - **Reliability Statistics**: Cohen's and Fleiss' kappa over repeated
//!   perturbed passes, cross-model comparison, stability runs
//! - **Saturation & Sampling**: codebook growth tracking with a halt
//!   criterion, and theoretical sampling advice for the next documents
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use qualweave::pipeline::{AnalysisPipeline, Methodology};
//! use qualweave::gateway::OpenAiGateway;
//! use qualweave::types::{Document, ProjectState};
//!
//! let mut state = ProjectState::new("study", Methodology::GroundedTheory);
//! state.add_document(Document::new("interview-1", transcript, vec![]));
//!
//! let gateway = Arc::new(OpenAiGateway::new(&config.gateway)?);
//! let outcome = AnalysisPipeline::new(gateway).run(&mut state).await?;
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`]: methodologies, stages, and the run/resume loop
//! - [`gateway`]: LLM providers behind one schema-validated trait
//! - [`review`]: human decisions over proposed codes, with audit records
//! - [`stats`]: agreement coefficients, reliability runs, saturation
//! - [`sampling`]: theoretical sampling recommendations
//! - [`storage`]: SQLite persistence with connection pooling
//! - [`config`]: layered configuration (defaults, global, project, env)

pub mod cli;
pub mod config;
pub mod constants;
pub mod gateway;
pub mod pipeline;
pub mod review;
pub mod sampling;
pub mod stats;
pub mod storage;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader, GatewayConfig};

// Error Types
pub use types::error::{GatewayError, QualError, Result, ResultExt};

// Domain Types
pub use types::{
    Code, CodeApplication, Codebook, Document, ProjectState, ReviewDecision, Span, StateDelta,
};

// Storage
pub use storage::{Database, PoolConfig, SharedDatabase};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use pipeline::{AnalysisPipeline, Methodology, PipelineOutcome, StageKind};

pub use review::{ReviewManager, ReviewOutcome};

// =============================================================================
// Gateway Re-exports
// =============================================================================

pub use gateway::{
    build_gateway, CallOptions, LlmGateway, OllamaGateway, OpenAiGateway, RetryPolicy,
    SchemaDescriptor, ScriptedGateway, SharedGateway,
};

// =============================================================================
// Stats Re-exports
// =============================================================================

pub use sampling::{SamplingRecommendation, TheoreticalSamplingAdvisor};
pub use stats::{
    Kappa, PairAgreement, ReliabilityEngine, ReliabilityReport, SaturationConfig,
    SaturationDetector, SaturationSignal,
};
