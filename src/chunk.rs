//! Sentence-window text chunker.
//!
//! Splits extracted [`Segment`]s into [`Passage`]s that respect a
//! `max_words` budget. Splitting occurs on sentence boundaries to keep each
//! passage readable as evidence, and consecutive passages share a short
//! overlap so a fact straddling a boundary is retrievable from either side.
//!
//! # Algorithm
//!
//! 1. Collapse whitespace in each segment and split it into sentences.
//! 2. Hard-split any sentence longer than `max_words` on word boundaries.
//! 3. Accumulate sentences into a window until the next one would exceed
//!    `max_words`.
//! 4. Flush the window as a passage, then seed the next window with the
//!    trailing sentences that fit in `overlap_words`.
//! 5. Never let a window cross a segment (page, slide, section) boundary.
//!
//! Passage ids are `"<document_id>:<seq>"` and `seq` is contiguous across
//! the whole document, so chunking the same input twice yields identical
//! passages.

use sha2::{Digest, Sha256};

use crate::extract::Segment;
use crate::models::{Locator, Passage};
use crate::text::{clean_text, split_sentences, word_count};

/// Window sizing for [`chunk_segments`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkingParams {
    pub max_words: usize,
    pub overlap_words: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            max_words: 400,
            overlap_words: 50,
        }
    }
}

/// Identity of the document being chunked, copied into every passage.
#[derive(Debug, Clone, Copy)]
pub struct DocumentRef<'a> {
    pub document_id: &'a str,
    pub subject_id: &'a str,
    pub filename: &'a str,
}

/// Split segments into passages with contiguous sequence indices.
///
/// Segments with no text after cleaning contribute no passages; an empty
/// return value means the document had nothing to index.
pub fn chunk_segments(
    doc: DocumentRef<'_>,
    segments: &[Segment],
    params: ChunkingParams,
) -> Vec<Passage> {
    let max_words = params.max_words.max(1);
    let mut passages = Vec::new();

    for segment in segments {
        let cleaned = clean_text(&segment.text);
        if cleaned.is_empty() {
            continue;
        }
        for window in sentence_windows(&cleaned, max_words, params.overlap_words) {
            let seq = passages.len() as i64;
            passages.push(make_passage(doc, seq, &window, segment.locator.clone()));
        }
    }

    passages
}

/// Pack sentences into overlapping windows of at most `max_words` words.
fn sentence_windows(text: &str, max_words: usize, overlap_words: usize) -> Vec<String> {
    let mut units: Vec<(String, usize)> = Vec::new();
    for sentence in split_sentences(text) {
        let count = word_count(sentence);
        if count > max_words {
            let words: Vec<&str> = sentence.split_whitespace().collect();
            for piece in words.chunks(max_words) {
                units.push((piece.join(" "), piece.len()));
            }
        } else {
            units.push((sentence.to_string(), count));
        }
    }

    let mut windows = Vec::new();
    let mut window: Vec<(String, usize)> = Vec::new();
    let mut words = 0usize;

    for (sentence, count) in units {
        if words + count > max_words && !window.is_empty() {
            windows.push(join_window(&window));

            let mut kept = 0usize;
            let mut keep_from = window.len();
            while keep_from > 0 && kept + window[keep_from - 1].1 <= overlap_words {
                keep_from -= 1;
                kept += window[keep_from].1;
            }
            window.drain(..keep_from);
            words = kept;

            if words + count > max_words {
                window.clear();
                words = 0;
            }
        }
        window.push((sentence, count));
        words += count;
    }

    if !window.is_empty() {
        windows.push(join_window(&window));
    }
    windows
}

fn join_window(window: &[(String, usize)]) -> String {
    window
        .iter()
        .map(|(s, _)| s.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Create a single [`Passage`] with a deterministic id and SHA-256 content hash.
fn make_passage(doc: DocumentRef<'_>, seq: i64, text: &str, locator: Option<Locator>) -> Passage {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Passage {
        id: Passage::make_id(doc.document_id, seq),
        document_id: doc.document_id.to_string(),
        subject_id: doc.subject_id.to_string(),
        filename: doc.filename.to_string(),
        seq,
        text: text.to_string(),
        locator,
        hash,
    }
}
