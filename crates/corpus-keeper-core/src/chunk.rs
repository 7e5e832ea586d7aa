//! Boundary-aware text chunker with overlap.
//!
//! Splits document content into [`Chunk`]s no longer than `max_length`
//! characters. Each window's right edge is pulled back to the nearest
//! configured delimiter (paragraph, line, sentence, word) that lies no
//! further than `max_length / 2` before the edge; the next window starts
//! `overlap` characters before the previous cut.
//!
//! Each chunk records its character offsets in the parent, so
//! [`reconstruct`] can rebuild the parent content exactly by dropping the
//! overlapping prefix of every chunk after the first.
//!
//! # Algorithm
//!
//! 1. Content of at most `max_length` characters yields exactly one chunk.
//! 2. Otherwise scan windows `[start, start + max_length)`.
//! 3. For a window ending mid-content, try delimiters in priority order;
//!    the last occurrence within `[edge - max_length/2, edge]` is the cut.
//!    With no delimiter in range, cut hard at the edge.
//! 4. Advance `start` to `cut - overlap` (or to `cut` when that would not
//!    move forward).
//! 5. When a cut would leave fewer than `min_length` characters for the
//!    final chunk, the cut is searched again with the edge pulled back to
//!    `len - min_length`, so no tiny trailing fragment is emitted.
//!
//! The second half of this module is the validation layer: every
//! candidate chunk is screened and rejections are tallied in an
//! [`ExclusionReport`] instead of raising.
//!
//! # Example
//!
//! ```rust
//! use corpus_keeper_core::chunk::Chunker;
//! use corpus_keeper_core::models::Metadata;
//!
//! let chunker = Chunker::new(1000, 200).unwrap();
//! let chunks = chunker.split("doc-1", "Hello world.", &Metadata::new());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].total, 1);
//! ```

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::ConfigError;
use crate::models::{Chunk, Metadata, MetadataValue};
use crate::schema::ReservedKeys;

/// Default boundary delimiters, highest priority first.
pub const DEFAULT_DELIMITERS: [&str; 7] = ["\n\n", "\n", ". ", "! ", "? ", "; ", " "];

pub const DEFAULT_MIN_LENGTH: usize = 50;
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct Chunker {
    max_length: usize,
    overlap: usize,
    min_length: usize,
    batch_size: usize,
    delimiters: Vec<Vec<char>>,
}

impl Chunker {
    /// Build a chunker. `overlap >= max_length` is rejected here, not at
    /// split time.
    pub fn new(max_length: usize, overlap: usize) -> Result<Self, ConfigError> {
        if max_length == 0 {
            return Err(ConfigError::ZeroMaxLength);
        }
        if overlap >= max_length {
            return Err(ConfigError::OverlapTooLarge {
                overlap,
                max_length,
            });
        }
        Ok(Self {
            max_length,
            overlap,
            min_length: DEFAULT_MIN_LENGTH,
            batch_size: DEFAULT_BATCH_SIZE,
            delimiters: DEFAULT_DELIMITERS
                .iter()
                .map(|d| d.chars().collect())
                .collect(),
        })
    }

    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    pub fn with_delimiters<I, S>(mut self, delimiters: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let delimiters: Vec<Vec<char>> = delimiters
            .into_iter()
            .map(|d| d.as_ref().chars().collect::<Vec<char>>())
            .filter(|d| !d.is_empty())
            .collect();
        if delimiters.is_empty() {
            return Err(ConfigError::NoDelimiters);
        }
        self.delimiters = delimiters;
        Ok(self)
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Whether `content` must be split at all.
    pub fn needs_split(&self, content: &str) -> bool {
        content.chars().count() > self.max_length
    }

    /// Compute the `(start, end)` character spans for `content`.
    pub fn spans(&self, content: &str) -> Vec<(usize, usize)> {
        let chars: Vec<char> = content.chars().collect();
        let len = chars.len();
        if len <= self.max_length {
            return vec![(0, len)];
        }

        let mut spans = Vec::new();
        let mut start = 0;
        loop {
            let edge = start + self.max_length;
            if edge >= len {
                spans.push((start, len));
                break;
            }
            let mut end = self.find_cut(&chars, start, edge);
            let tail_limit = len.saturating_sub(self.min_length);
            if len - end < self.min_length && tail_limit > start {
                end = self.find_cut(&chars, start, tail_limit);
            }
            spans.push((start, end));
            start = if end > start + self.overlap {
                end - self.overlap
            } else {
                end
            };
        }
        spans
    }

    /// Split `content` into chunks carrying parent metadata plus lineage
    /// fields. Pure function of its inputs.
    pub fn split(&self, parent_id: &str, content: &str, parent_metadata: &Metadata) -> Vec<Chunk> {
        let spans = self.spans(content);
        let total = spans.len();
        let chars: Vec<char> = content.chars().collect();

        spans
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                let text: String = chars[start..end].iter().collect();
                let mut metadata = parent_metadata.clone();
                metadata.insert("parent_id".into(), parent_id.into());
                metadata.insert("chunk_index".into(), MetadataValue::Int(index as i64));
                metadata.insert("total_chunks".into(), MetadataValue::Int(total as i64));
                metadata.insert(
                    "batch_index".into(),
                    MetadataValue::Int((index / self.batch_size) as i64),
                );
                metadata.insert("start_offset".into(), MetadataValue::Int(start as i64));
                metadata.insert("end_offset".into(), MetadataValue::Int(end as i64));
                metadata.insert(
                    "chunk_info".into(),
                    format!("{}/{}", index + 1, total).into(),
                );
                Chunk {
                    parent_id: parent_id.to_string(),
                    index,
                    total,
                    start,
                    end,
                    text,
                    metadata,
                }
            })
            .collect()
    }

    fn find_cut(&self, chars: &[char], start: usize, edge: usize) -> usize {
        let floor = edge.saturating_sub(self.max_length / 2).max(start + 1);
        for delim in &self.delimiters {
            let dlen = delim.len();
            let mut pos = edge;
            while pos >= floor {
                if pos >= start + dlen && chars[pos - dlen..pos] == delim[..] {
                    return pos;
                }
                pos -= 1;
            }
        }
        edge
    }
}

/// Rebuild parent content from its chunks, dropping each chunk's overlap
/// with the previous one. Returns `None` if the chunks leave a gap.
pub fn reconstruct(chunks: &[Chunk]) -> Option<String> {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let mut out = String::new();
    let mut covered = 0;
    for chunk in ordered {
        if chunk.start > covered {
            return None;
        }
        let skip = covered - chunk.start;
        out.extend(chunk.text.chars().skip(skip));
        covered = covered.max(chunk.end);
    }
    Some(out)
}

// ─── Validation layer ──────────────────────────────────────────────

/// Why a candidate was excluded from the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    NotText,
    Empty,
    TooLong,
    ControlCharacters,
    NestedMetadata,
    SchemaViolation,
    DuplicateInBatch,
    DuplicateInCollection,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::NotText => "not_text",
            ExclusionReason::Empty => "empty",
            ExclusionReason::TooLong => "too_long",
            ExclusionReason::ControlCharacters => "control_characters",
            ExclusionReason::NestedMetadata => "nested_metadata",
            ExclusionReason::SchemaViolation => "schema_violation",
            ExclusionReason::DuplicateInBatch => "duplicate_in_batch",
            ExclusionReason::DuplicateInCollection => "duplicate_in_collection",
        }
    }
}

/// Maximum sample instances kept per reason.
pub const MAX_SAMPLES: usize = 3;

/// Aggregated rejections: a count and up to [`MAX_SAMPLES`] sample ids
/// per reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExclusionReport {
    pub counts: BTreeMap<ExclusionReason, usize>,
    pub samples: BTreeMap<ExclusionReason, Vec<String>>,
}

impl ExclusionReport {
    pub fn record(&mut self, reason: ExclusionReason, sample: impl Into<String>) {
        *self.counts.entry(reason).or_insert(0) += 1;
        let samples = self.samples.entry(reason).or_default();
        if samples.len() < MAX_SAMPLES {
            samples.push(sample.into());
        }
    }

    pub fn merge(&mut self, other: ExclusionReport) {
        for (reason, count) in other.counts {
            *self.counts.entry(reason).or_insert(0) += count;
        }
        for (reason, list) in other.samples {
            let samples = self.samples.entry(reason).or_default();
            for s in list {
                if samples.len() >= MAX_SAMPLES {
                    break;
                }
                samples.push(s);
            }
        }
    }

    pub fn count(&self, reason: ExclusionReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Screens candidates before they may reach the store.
#[derive(Debug, Clone)]
pub struct ChunkValidator {
    max_length: usize,
    reserved: ReservedKeys,
}

impl ChunkValidator {
    pub fn new(max_length: usize, reserved: ReservedKeys) -> Self {
        Self {
            max_length,
            reserved,
        }
    }

    pub fn for_chunker(chunker: &Chunker, reserved: ReservedKeys) -> Self {
        Self::new(chunker.max_length(), reserved)
    }

    pub fn validate_text(&self, text: &str) -> Result<(), ExclusionReason> {
        if text.trim().is_empty() {
            return Err(ExclusionReason::Empty);
        }
        if text.chars().count() > self.max_length {
            return Err(ExclusionReason::TooLong);
        }
        if text.chars().any(is_disallowed_control) {
            return Err(ExclusionReason::ControlCharacters);
        }
        Ok(())
    }

    /// Accept raw content only if it is a JSON string. Length is not
    /// checked here; oversized text is split first.
    pub fn text_content(&self, content: &serde_json::Value) -> Result<String, ExclusionReason> {
        let text = content.as_str().ok_or(ExclusionReason::NotText)?;
        if text.trim().is_empty() {
            return Err(ExclusionReason::Empty);
        }
        if text.chars().any(is_disallowed_control) {
            return Err(ExclusionReason::ControlCharacters);
        }
        Ok(text.to_string())
    }

    /// Flatten raw metadata into a [`Metadata`] map. Values outside the
    /// primitive set (objects, mixed arrays) are JSON-stringified rather
    /// than rejecting the record; only metadata that is not an object at
    /// all is refused. Reserved keys are stripped from the result.
    pub fn flat_metadata(&self, raw: Option<&serde_json::Value>) -> Result<Metadata, ExclusionReason> {
        let obj = match raw {
            None | Some(serde_json::Value::Null) => return Ok(Metadata::new()),
            Some(serde_json::Value::Object(obj)) => obj,
            Some(_) => return Err(ExclusionReason::NestedMetadata),
        };
        let mut metadata: Metadata = obj
            .iter()
            .map(|(key, value)| (key.clone(), MetadataValue::from_json(value)))
            .collect();
        self.reserved.strip(&mut metadata);
        Ok(metadata)
    }

    /// Keep chunks that pass [`validate_text`](Self::validate_text);
    /// reserved keys are stripped from the survivors.
    pub fn screen(&self, chunks: Vec<Chunk>, report: &mut ExclusionReport) -> Vec<Chunk> {
        chunks
            .into_iter()
            .filter_map(|mut chunk| match self.validate_text(&chunk.text) {
                Ok(()) => {
                    self.reserved.strip(&mut chunk.metadata);
                    Some(chunk)
                }
                Err(reason) => {
                    report.record(reason, chunk.id());
                    None
                }
            })
            .collect()
    }
}

fn is_disallowed_control(c: char) -> bool {
    c.is_control() && !matches!(c, '\n' | '\r' | '\t')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prose(len: usize) -> String {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        sentence.repeat(len / sentence.len() + 1)[..len].to_string()
    }

    #[test]
    fn test_rejects_overlap_not_below_max() {
        assert_eq!(
            Chunker::new(100, 100).unwrap_err(),
            ConfigError::OverlapTooLarge {
                overlap: 100,
                max_length: 100
            }
        );
        assert!(Chunker::new(100, 150).is_err());
        assert_eq!(Chunker::new(0, 0).unwrap_err(), ConfigError::ZeroMaxLength);
    }

    #[test]
    fn test_short_content_single_chunk() {
        let chunker = Chunker::new(1000, 200).unwrap();
        let chunks = chunker.split("p", "short", &Metadata::new());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short");
        assert_eq!(chunks[0].metadata["total_chunks"], MetadataValue::Int(1));
    }

    #[test]
    fn test_five_thousand_chars() {
        let chunker = Chunker::new(1000, 200).unwrap();
        let content = "abcdefghij".repeat(500);
        let chunks = chunker.split("p", &content, &Metadata::new());
        assert_eq!(chunks.len(), 6);
        for c in &chunks {
            assert!(c.text.chars().count() <= 1000);
            assert_eq!(c.total, chunks.len());
            assert_eq!(
                c.metadata["total_chunks"],
                MetadataValue::Int(chunks.len() as i64)
            );
        }
        assert_eq!(reconstruct(&chunks).unwrap(), content);
    }

    #[test]
    fn test_five_thousand_chars_of_prose() {
        // Pulling each cut back to a sentence end shortens the stride to
        // about 765 characters, so prose needs one more chunk than
        // delimiter-free text of the same length.
        let chunker = Chunker::new(1000, 200).unwrap();
        let content = prose(5000);
        assert_eq!(
            chunker.spans(&content),
            vec![
                (0, 990),
                (790, 1755),
                (1555, 2520),
                (2320, 3285),
                (3085, 4050),
                (3850, 4815),
                (4615, 5000),
            ]
        );
        let chunks = chunker.split("p", &content, &Metadata::new());
        assert!(chunks.iter().all(|c| c.total == 7 && c.text.chars().count() <= 1000));
        assert_eq!(reconstruct(&chunks).unwrap(), content);
    }

    #[test]
    fn test_cuts_on_sentence_boundary() {
        let chunker = Chunker::new(200, 20).unwrap();
        let content = prose(1000);
        let chunks = chunker.split("p", &content, &Metadata::new());
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.text.ends_with(". "), "chunk ended mid-sentence: {:?}", c.text);
        }
        assert_eq!(reconstruct(&chunks).unwrap(), content);
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let chunker = Chunker::new(100, 0).unwrap().with_min_length(0);
        let content = format!("{}\n\n{}", "a ".repeat(35), "b ".repeat(60));
        let chunks = chunker.split("p", &content, &Metadata::new());
        assert!(chunks[0].text.ends_with("\n\n"));
        assert_eq!(reconstruct(&chunks).unwrap(), content);
    }

    #[test]
    fn test_indices_contiguous_and_lineage() {
        let chunker = Chunker::new(50, 10).unwrap().with_batch_size(2).unwrap();
        let content = prose(400);
        let chunks = chunker.split("parent", &content, &Metadata::new());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.id(), format!("parent_chunk_{}", i));
            assert_eq!(c.metadata["parent_id"], "parent".into());
            assert_eq!(c.metadata["batch_index"], MetadataValue::Int((i / 2) as i64));
        }
    }

    #[test]
    fn test_no_tiny_trailing_fragment() {
        let chunker = Chunker::new(100, 0).unwrap().with_min_length(30);
        let content = format!("{}\n\n{}", "x".repeat(80), "y".repeat(28));
        assert_eq!(chunker.spans(&content), vec![(0, 80), (80, 110)]);

        let chunker = chunker.with_delimiters(["|"]).unwrap();
        let content = format!("{}|{}", "x".repeat(60), "y".repeat(45));
        assert_eq!(chunker.spans(&content), vec![(0, 61), (61, 106)]);
        let chunks = chunker.split("p", &content, &Metadata::new());
        assert_eq!(reconstruct(&chunks).unwrap(), content);
    }

    #[test]
    fn test_multibyte_characters() {
        let chunker = Chunker::new(10, 3).unwrap().with_min_length(0);
        let content = "┌──────────────────┐ héllo wörld ✓✓✓✓✓";
        let chunks = chunker.split("p", content, &Metadata::new());
        for c in &chunks {
            assert!(c.text.chars().count() <= 10);
        }
        assert_eq!(reconstruct(&chunks).unwrap(), content);
    }

    #[test]
    fn test_deterministic() {
        let chunker = Chunker::new(120, 30).unwrap();
        let content = prose(900);
        assert_eq!(
            chunker.split("p", &content, &Metadata::new()),
            chunker.split("p", &content, &Metadata::new())
        );
    }

    #[test]
    fn test_validator_reasons() {
        let v = ChunkValidator::new(10, ReservedKeys::default());
        assert_eq!(v.validate_text("   "), Err(ExclusionReason::Empty));
        assert_eq!(v.validate_text("0123456789x"), Err(ExclusionReason::TooLong));
        assert_eq!(v.validate_text("bad\u{0007}"), Err(ExclusionReason::ControlCharacters));
        assert_eq!(v.validate_text("ok\tline\n"), Ok(()));
        assert_eq!(v.text_content(&json!(12)), Err(ExclusionReason::NotText));
        assert_eq!(
            v.flat_metadata(Some(&json!(["not", "a", "map"]))),
            Err(ExclusionReason::NestedMetadata)
        );
        let m = v
            .flat_metadata(Some(&json!({"a": {"b": 1}, "mixed": [1, "x"]})))
            .unwrap();
        assert_eq!(m["a"], MetadataValue::Str(r#"{"b":1}"#.into()));
        assert_eq!(m["mixed"], MetadataValue::Str(r#"[1,"x"]"#.into()));
        let m = v
            .flat_metadata(Some(&json!({"a": 1, "_sys_x": "y"})))
            .unwrap();
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_exclusion_report_samples_capped() {
        let mut report = ExclusionReport::default();
        for i in 0..5 {
            report.record(ExclusionReason::Empty, format!("d{}", i));
        }
        let mut other = ExclusionReport::default();
        other.record(ExclusionReason::TooLong, "t1");
        other.record(ExclusionReason::Empty, "d9");
        report.merge(other);
        assert_eq!(report.count(ExclusionReason::Empty), 6);
        assert_eq!(report.samples[&ExclusionReason::Empty].len(), MAX_SAMPLES);
        assert_eq!(report.total(), 7);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["counts"]["empty"], 6);
    }

    #[test]
    fn test_screen_records_rejections() {
        let chunker = Chunker::new(100, 0).unwrap();
        let validator = ChunkValidator::for_chunker(&chunker, ReservedKeys::default());
        let mut meta = Metadata::new();
        meta.insert("_sys_embedding".into(), "v".into());
        let mut chunks = chunker.split("p", "fine text", &meta);
        chunks.push(Chunk {
            parent_id: "p".into(),
            index: 1,
            total: 2,
            start: 9,
            end: 11,
            text: "  ".into(),
            metadata: Metadata::new(),
        });
        let mut report = ExclusionReport::default();
        let kept = validator.screen(chunks, &mut report);
        assert_eq!(kept.len(), 1);
        assert!(!kept[0].metadata.contains_key("_sys_embedding"));
        assert_eq!(report.samples[&ExclusionReason::Empty], vec!["p_chunk_1".to_string()]);
    }
}
