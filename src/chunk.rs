//! Recursive character text chunker with overlap.
//!
//! Splits document text into [`Passage`]s no longer than a profile's
//! `max_chunk_size` characters. Splitting prefers paragraph boundaries
//! (`\n\n`), then lines, then words, and only cuts inside a word when a
//! single word is longer than the limit. Adjacent passages share up to
//! `overlap` characters of trailing context so that a sentence cut at a
//! boundary is still retrievable from either side.
//!
//! Each passage receives a fresh UUID, its position in the document, and a
//! SHA-256 hash of its text.

use std::collections::VecDeque;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Passage, PassageMetadata, SourceKind};

/// Separators tried in order; `""` means "between any two characters".
const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Chunk size and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct ChunkProfile {
    pub max_chunk_size: usize,
    pub overlap: usize,
}

impl ChunkProfile {
    /// Coarse profile for plain uploaded text.
    pub const TEXT: ChunkProfile = ChunkProfile {
        max_chunk_size: 1000,
        overlap: 200,
    };

    /// Finer profile for text extracted by loaders (PDF, HTML), which
    /// carries more formatting noise per character.
    pub const LOADER: ChunkProfile = ChunkProfile {
        max_chunk_size: 512,
        overlap: 100,
    };
}

/// Metadata stamped on every passage of one document.
#[derive(Debug, Clone)]
pub struct ChunkTags {
    pub assistant_id: String,
    pub document_id: String,
    pub file_name: String,
    pub source_kind: SourceKind,
    pub source_url: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

/// Split `text` into passages. Empty or blank text yields no passages.
pub fn chunk_text(text: &str, profile: &ChunkProfile, tags: &ChunkTags) -> Vec<Passage> {
    chunk_fragments(&[text], profile, tags)
}

/// Split several fragments of one document (e.g. loaded pages).
///
/// Fragments are split independently; passage indices run contiguously
/// across all of them starting at 0.
pub fn chunk_fragments<S: AsRef<str>>(
    fragments: &[S],
    profile: &ChunkProfile,
    tags: &ChunkTags,
) -> Vec<Passage> {
    let ingested_at = tags
        .ingested_at
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    fragments
        .iter()
        .flat_map(|f| split_text(f.as_ref(), profile))
        .enumerate()
        .map(|(index, text)| make_passage(tags, &ingested_at, index, text))
        .collect()
}

/// Split raw text into chunk strings according to `profile`.
///
/// Text that already fits is returned unchanged as a single chunk.
pub fn split_text(text: &str, profile: &ChunkProfile) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    if char_len(text) <= profile.max_chunk_size {
        return vec![text.to_string()];
    }
    split_recursive(text, SEPARATORS, profile)
}

fn split_recursive(text: &str, separators: &[&str], profile: &ChunkProfile) -> Vec<String> {
    let (position, separator) = separators
        .iter()
        .enumerate()
        .find(|(_, s)| s.is_empty() || text.contains(**s))
        .map(|(i, s)| (i, *s))
        .unwrap_or((separators.len().saturating_sub(1), ""));
    let remaining = separators.get(position + 1..).unwrap_or(&[]);

    let pieces: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split(separator).filter(|p| !p.is_empty()).collect()
    };

    let mut out = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();

    for piece in pieces {
        if char_len(piece) < profile.max_chunk_size {
            fitting.push(piece);
            continue;
        }
        if !fitting.is_empty() {
            out.extend(merge_splits(&fitting, separator, profile));
            fitting.clear();
        }
        if remaining.is_empty() {
            out.push(piece.to_string());
        } else {
            out.extend(split_recursive(piece, remaining, profile));
        }
    }

    if !fitting.is_empty() {
        out.extend(merge_splits(&fitting, separator, profile));
    }

    out
}

/// Greedily pack small pieces into chunks, carrying the tail of each chunk
/// (at most `overlap` characters) into the next one.
fn merge_splits(pieces: &[&str], separator: &str, profile: &ChunkProfile) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut chunks = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let len = char_len(piece);
        let joiner = if window.is_empty() { 0 } else { sep_len };

        if total + len + joiner > profile.max_chunk_size && !window.is_empty() {
            push_joined(&mut chunks, &window, separator);

            while total > profile.overlap
                || (total > 0
                    && total + len + if window.is_empty() { 0 } else { sep_len }
                        > profile.max_chunk_size)
            {
                let Some(front) = window.pop_front() else {
                    break;
                };
                total -= char_len(front) + if window.is_empty() { 0 } else { sep_len };
            }
        }

        let joiner = if window.is_empty() { 0 } else { sep_len };
        window.push_back(piece);
        total += len + joiner;
    }

    if !window.is_empty() {
        push_joined(&mut chunks, &window, separator);
    }

    chunks
}

fn push_joined(chunks: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn make_passage(tags: &ChunkTags, ingested_at: &str, index: usize, text: String) -> Passage {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    Passage {
        id: Uuid::new_v4().to_string(),
        chunk_index: index,
        text,
        metadata: PassageMetadata {
            assistant_id: tags.assistant_id.clone(),
            document_id: tags.document_id.clone(),
            file_name: tags.file_name.clone(),
            source_kind: tags.source_kind,
            source_url: tags.source_url.clone(),
            ingested_at: ingested_at.to_string(),
            content_hash,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> ChunkTags {
        ChunkTags {
            assistant_id: "assistant-x".to_string(),
            document_id: "doc-1".to_string(),
            file_name: "sky.txt".to_string(),
            source_kind: SourceKind::Text,
            source_url: None,
            ingested_at: Utc::now(),
        }
    }

    fn words(n: usize) -> String {
        (0..n)
            .map(|i| format!("w{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_short_text_single_chunk() {
        let passages = chunk_text("The sky is blue.", &ChunkProfile::TEXT, &tags());
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].text, "The sky is blue.");
        assert_eq!(passages[0].chunk_index, 0);
    }

    #[test]
    fn test_short_text_kept_verbatim() {
        let text = "  spaced   out\n\ntext  ";
        let chunks = split_text(text, &ChunkProfile::TEXT);
        assert_eq!(chunks, vec![text.to_string()]);
    }

    #[test]
    fn test_empty_and_blank_text() {
        assert!(chunk_text("", &ChunkProfile::TEXT, &tags()).is_empty());
        assert!(chunk_text("  \n\n \t", &ChunkProfile::TEXT, &tags()).is_empty());
    }

    #[test]
    fn test_chunks_respect_max_size() {
        let profile = ChunkProfile {
            max_chunk_size: 100,
            overlap: 20,
        };
        let text = words(400);
        let chunks = split_text(&text, &profile);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 100, "chunk too long: {}", c.len());
        }
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let profile = ChunkProfile {
            max_chunk_size: 100,
            overlap: 20,
        };
        let chunks = split_text(&words(400), &profile);
        for pair in chunks.windows(2) {
            let first_of_next = pair[1].split(' ').next().unwrap();
            assert!(
                pair[0].split(' ').any(|w| w == first_of_next),
                "no overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_every_word_is_covered() {
        let profile = ChunkProfile {
            max_chunk_size: 64,
            overlap: 16,
        };
        let chunks = split_text(&words(300), &profile);
        for i in 0..300 {
            let w = format!("w{}", i);
            assert!(
                chunks.iter().any(|c| c.split(' ').any(|x| x == w)),
                "{} missing",
                w
            );
        }
    }

    #[test]
    fn test_paragraph_boundaries_preferred() {
        let profile = ChunkProfile {
            max_chunk_size: 40,
            overlap: 0,
        };
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird one.";
        let chunks = split_text(text, &profile);
        assert_eq!(chunks[0], "First paragraph here.");
        assert!(chunks.iter().all(|c| !c.starts_with('\n')));
    }

    #[test]
    fn test_unbroken_text_is_hard_split() {
        let text = "a".repeat(2500);
        let chunks = split_text(&text, &ChunkProfile::TEXT);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1000));
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let profile = ChunkProfile {
            max_chunk_size: 10,
            overlap: 3,
        };
        let text = "संविधान भारत का सर्वोच्च विधान है। ".repeat(10);
        let chunks = split_text(&text, &profile);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn test_fragment_indices_contiguous_and_tagged() {
        let profile = ChunkProfile::LOADER;
        let fragments = vec![words(300), String::new(), words(200)];
        let t = tags();
        let passages = chunk_fragments(&fragments, &profile, &t);
        assert!(passages.len() > 2);
        for (i, p) in passages.iter().enumerate() {
            assert_eq!(p.chunk_index, i);
            assert_eq!(p.metadata.assistant_id, "assistant-x");
            assert_eq!(p.metadata.document_id, "doc-1");
            assert_eq!(p.metadata.content_hash.len(), 64);
        }
    }

    #[test]
    fn test_deterministic_text() {
        let profile = ChunkProfile {
            max_chunk_size: 50,
            overlap: 10,
        };
        let text = words(120);
        assert_eq!(split_text(&text, &profile), split_text(&text, &profile));
    }
}
