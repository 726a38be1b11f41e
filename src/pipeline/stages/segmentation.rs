//! Segmentation Stage
//!
//! Splits each document into an ordered sequence of segments. The policy is
//! an injected strategy, not hardcoded: speaker-turn detection for transcripts
//! that carry `Speaker: utterance` lines, paragraph boundaries otherwise.
//! Purely local; no gateway calls.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::types::{Document, Result, Segment, Span, StateDelta};

use super::super::stage::{PipelineStage, StageContext, StageResult};

// =============================================================================
// Strategies
// =============================================================================

/// Segmentation policy over a document's raw text.
pub trait SegmentationStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn segment(&self, text: &str) -> Vec<Segment>;
}

/// `NAME:` at the start of a line opens a new speaker turn.
static SPEAKER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*([A-Z][A-Za-z .'\-]{0,40}?)[ \t]*:").expect("valid speaker regex")
});

/// Split on speaker turns (`Interviewer:`, `P1:`, ...). Text before the
/// first speaker marker becomes an unattributed segment.
#[derive(Debug, Default)]
pub struct SpeakerTurnStrategy;

impl SegmentationStrategy for SpeakerTurnStrategy {
    fn name(&self) -> &'static str {
        "speaker_turn"
    }

    fn segment(&self, text: &str) -> Vec<Segment> {
        let mut segments = Vec::new();
        let matches: Vec<_> = SPEAKER_LINE.captures_iter(text).collect();
        if matches.is_empty() {
            return ParagraphStrategy.segment(text);
        }

        let first_start = matches[0].get(0).map(|m| m.start()).unwrap_or(0);
        if first_start > 0 {
            push_segment(&mut segments, None, text, 0, first_start);
        }

        for (i, caps) in matches.iter().enumerate() {
            let whole = caps.get(0).expect("match 0 always present");
            let speaker = caps.get(1).map(|m| m.as_str().trim().to_string());
            let body_start = whole.end();
            let body_end = matches
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(text.len());
            push_segment(&mut segments, speaker, text, body_start, body_end);
        }
        segments
    }
}

/// Split on blank-line paragraph boundaries.
#[derive(Debug, Default)]
pub struct ParagraphStrategy;

impl SegmentationStrategy for ParagraphStrategy {
    fn name(&self) -> &'static str {
        "paragraph"
    }

    fn segment(&self, text: &str) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut start = 0usize;
        let bytes = text.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            // A blank line (two consecutive newlines, ignoring \r) ends a paragraph.
            if bytes[i] == b'\n' {
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j] == b'\r' || bytes[j] == b' ' || bytes[j] == b'\t')
                {
                    j += 1;
                }
                if j < bytes.len() && bytes[j] == b'\n' {
                    push_segment(&mut segments, None, text, start, i);
                    start = j + 1;
                    i = j + 1;
                    continue;
                }
            }
            i += 1;
        }
        push_segment(&mut segments, None, text, start, text.len());
        segments
    }
}

fn push_segment(
    segments: &mut Vec<Segment>,
    speaker: Option<String>,
    text: &str,
    start: usize,
    end: usize,
) {
    let raw = &text[start..end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    // Span covers the trimmed content within the original text.
    let lead = raw.len() - raw.trim_start().len();
    let span_start = start + lead;
    segments.push(Segment {
        speaker,
        text: trimmed.to_string(),
        span: Span::new(span_start, span_start + trimmed.len()),
    });
}

/// Pick a strategy per document: speaker turns when markers are present.
pub fn segment_document(doc: &Document) -> Vec<Segment> {
    if SPEAKER_LINE.is_match(&doc.text) {
        SpeakerTurnStrategy.segment(&doc.text)
    } else {
        ParagraphStrategy.segment(&doc.text)
    }
}

// =============================================================================
// Stage
// =============================================================================

/// Populates segments for documents that lack them. Re-running on the same
/// snapshot produces the same segments (idempotent).
#[derive(Debug, Default)]
pub struct SegmentationStage {
    /// Override strategy; `None` auto-detects per document.
    pub strategy: Option<Box<dyn SegmentationStrategy>>,
}

impl std::fmt::Debug for dyn SegmentationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SegmentationStrategy({})", self.name())
    }
}

#[async_trait]
impl PipelineStage for SegmentationStage {
    fn name(&self) -> &'static str {
        "segmentation"
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult> {
        let mut delta = StateDelta::default();
        for doc in &ctx.state().documents {
            if !doc.segments.is_empty() {
                continue;
            }
            let segments = match &self.strategy {
                Some(strategy) => strategy.segment(&doc.text),
                None => segment_document(doc),
            };
            debug!(document = %doc.id, count = segments.len(), "segmented document");
            delta.segment_updates.push((doc.id, segments));
        }
        Ok(StageResult::Completed(delta))
    }
}

// =============================================================================
// Tests
// =============================================================================
