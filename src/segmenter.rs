//! Text normalization and overlapping chunk segmentation.
//!
//! Sizes are measured in characters. Chunks are cut at the highest-priority
//! separator that keeps them within `max_chunk_size`, and every chunk after the
//! first begins with the last `overlap_size` characters of its predecessor.
//!
//! A chunk is an exact span of the normalized text. A cut after `". "` or `" "`
//! keeps that trailing space, and the next chunk may start on a space when its
//! overlap does; trimming either end would break the exact overlap.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::config::Settings;
use crate::error::SegmentError;

static CITATION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\d+\]").expect("citation marker pattern is valid"));
static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));
static PAGE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*--- PAGE (\d+) ---[ \t]*$").expect("page marker pattern is valid")
});

/// Split points in priority order: paragraph, line, sentence, word.
const SEPARATORS: [&[char]; 4] = [&['\n', '\n'], &['\n'], &['.', ' '], &[' ']];

const PAGE_JOINER: &str = "\n\n";

/// Collapses whitespace runs, strips bracketed numeric citations and trims.
/// `normalize(normalize(t)) == normalize(t)` for every input.
pub fn normalize(text: &str) -> String {
    let mut stripped = CITATION_MARKER.replace_all(text, "").into_owned();
    // "[[1]2]" only exposes "[2]" after the first pass
    while CITATION_MARKER.is_match(&stripped) {
        stripped = CITATION_MARKER.replace_all(&stripped, "").into_owned();
    }
    WHITESPACE_RUN.replace_all(&stripped, " ").trim().to_string()
}

/// Deterministic id: the same text at the same ordinal always maps to the same record.
pub fn chunk_id(ordinal: usize, text: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    format!("chunk_{}_{}", ordinal, &digest[..16])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// 0-based position within the ingestion batch.
    pub ordinal: usize,
    pub source_page: Option<u32>,
    /// Name of the originating document, when known.
    pub source: Option<String>,
    /// Character offsets into the normalized, page-joined text of the source document.
    pub char_start: usize,
    pub char_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn ordinal(&self) -> usize {
        self.metadata.ordinal
    }

    pub fn source_page(&self) -> Option<u32> {
        self.metadata.source_page
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub number: Option<u32>,
    pub text: String,
}

/// Extracted document text, one entry per page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub name: Option<String>,
    pub pages: Vec<Page>,
}

impl Document {
    pub fn from_text(name: Option<String>, text: impl Into<String>) -> Self {
        Self {
            name,
            pages: vec![Page {
                number: None,
                text: text.into(),
            }],
        }
    }

    pub fn from_pages<I, S>(name: Option<String>, pages: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        Self {
            name,
            pages: pages
                .into_iter()
                .map(|(number, text)| Page {
                    number: Some(number),
                    text: text.into(),
                })
                .collect(),
        }
    }

    /// Parses extraction output where each page is introduced by a `--- PAGE n ---` line.
    /// Text before the first marker (or text with no markers) becomes a page without a number.
    /// A repeated page number is an error; use [`Document::split_marked_text`] for output
    /// covering several files.
    pub fn from_marked_text(name: Option<String>, text: &str) -> Result<Self, SegmentError> {
        let pages = marked_pages(text);
        let mut seen = HashSet::new();
        for page in pages.iter().filter_map(|page| page.number) {
            if !seen.insert(page) {
                return Err(SegmentError::DuplicatePage { page });
            }
        }
        Ok(Self { name, pages })
    }

    /// Parses extraction output for a multi-file upload, where page numbering restarts
    /// with each file. A page number already seen opens the next document. When the
    /// text holds more than one document, names get a `#1`, `#2`, ... suffix.
    pub fn split_marked_text(name: Option<String>, text: &str) -> Vec<Self> {
        let mut groups: Vec<Vec<Page>> = Vec::new();
        let mut seen = HashSet::new();
        for page in marked_pages(text) {
            let repeated = page.number.map_or(false, |number| !seen.insert(number));
            if repeated || groups.is_empty() {
                seen.clear();
                if let Some(number) = page.number {
                    seen.insert(number);
                }
                groups.push(Vec::new());
            }
            if let Some(group) = groups.last_mut() {
                group.push(page);
            }
        }

        let multiple = groups.len() > 1;
        groups
            .into_iter()
            .enumerate()
            .map(|(i, pages)| Self {
                name: match &name {
                    Some(name) if multiple => Some(format!("{}#{}", name, i + 1)),
                    other => other.clone(),
                },
                pages,
            })
            .collect()
    }
}

fn marked_pages(text: &str) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut cursor = 0;
    let mut current: Option<u32> = None;

    for caps in PAGE_MARKER.captures_iter(text) {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let body = &text[cursor..whole.start()];
        if current.is_some() || !body.trim().is_empty() {
            pages.push(Page {
                number: current,
                text: body.to_string(),
            });
        }
        // digits only, so parsing fails solely on overflow
        current = Some(number.as_str().parse::<u32>().unwrap_or(u32::MAX));
        cursor = whole.end();
    }

    let tail = &text[cursor..];
    if current.is_some() || !tail.trim().is_empty() {
        pages.push(Page {
            number: current,
            text: tail.to_string(),
        });
    }
    pages
}

#[derive(Debug, Clone)]
pub struct Segmenter {
    max_chunk_size: usize,
    overlap_size: usize,
}

impl Segmenter {
    pub fn new(max_chunk_size: usize, overlap_size: usize) -> Result<Self, SegmentError> {
        if max_chunk_size == 0 || overlap_size >= max_chunk_size {
            return Err(SegmentError::InvalidSizes {
                max_chunk_size,
                overlap: overlap_size,
            });
        }
        Ok(Self {
            max_chunk_size,
            overlap_size,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SegmentError> {
        Self::new(settings.max_chunk_size, settings.overlap_size)
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn overlap_size(&self) -> usize {
        self.overlap_size
    }

    /// Segments plain text with no page or source attribution.
    pub fn segment(&self, text: &str) -> Result<Vec<Chunk>, SegmentError> {
        self.segment_document(&Document::from_text(None, text))
    }

    /// Normalizes each page, joins pages with a paragraph break and splits the result.
    /// Each chunk is attributed to the page holding its first character.
    pub fn segment_document(&self, document: &Document) -> Result<Vec<Chunk>, SegmentError> {
        for page in &document.pages {
            reject_nul(&page.text)?;
        }

        let mut joined: Vec<char> = Vec::new();
        let mut page_starts: Vec<(usize, Option<u32>)> = Vec::new();
        for page in &document.pages {
            let normalized = normalize(&page.text);
            if normalized.is_empty() {
                continue;
            }
            if !joined.is_empty() {
                joined.extend(PAGE_JOINER.chars());
            }
            page_starts.push((joined.len(), page.number));
            joined.extend(normalized.chars());
        }

        let chunks = self
            .split_spans(&joined)
            .into_iter()
            .enumerate()
            .map(|(ordinal, (start, end))| {
                let text: String = joined[start..end].iter().collect();
                let source_page = page_starts
                    .iter()
                    .take_while(|(page_start, _)| *page_start <= start)
                    .last()
                    .and_then(|(_, number)| *number);
                Chunk {
                    id: chunk_id(ordinal, &text),
                    text,
                    metadata: ChunkMetadata {
                        ordinal,
                        source_page,
                        source: document.name.clone(),
                        char_start: start,
                        char_end: end,
                    },
                }
            })
            .collect();

        Ok(chunks)
    }

    /// Segments several documents as one upload. Ordinals, and so ids, continue
    /// from one document to the next.
    pub fn segment_documents(&self, documents: &[Document]) -> Result<Vec<Chunk>, SegmentError> {
        let mut chunks = Vec::new();
        for document in documents {
            for mut chunk in self.segment_document(document)? {
                let ordinal = chunks.len();
                chunk.metadata.ordinal = ordinal;
                chunk.id = chunk_id(ordinal, &chunk.text);
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    fn split_spans(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let len = chars.len();
        let mut spans = Vec::new();
        let mut start = 0;

        while len - start > self.max_chunk_size {
            let limit = start + self.max_chunk_size;
            // cutting at or before this point would stall the next chunk's start
            let floor = start + self.overlap_size;
            let end = SEPARATORS
                .iter()
                .find_map(|separator| last_cut(chars, separator, floor, limit))
                .unwrap_or(limit);
            spans.push((start, end));
            start = end - self.overlap_size;
        }

        if start < len {
            spans.push((start, len));
        }
        spans
    }
}

/// Convenience wrapper over [`Segmenter::segment`].
pub fn segment(
    text: &str,
    max_chunk_size: usize,
    overlap_size: usize,
) -> Result<Vec<Chunk>, SegmentError> {
    Segmenter::new(max_chunk_size, overlap_size)?.segment(text)
}

/// Largest cut position in `(floor, limit]` that falls right after `separator`.
fn last_cut(chars: &[char], separator: &[char], floor: usize, limit: usize) -> Option<usize> {
    let width = separator.len();
    if limit < width {
        return None;
    }
    let mut pos = limit - width;
    loop {
        let cut = pos + width;
        if cut <= floor {
            return None;
        }
        if &chars[pos..cut] == separator {
            return Some(cut);
        }
        if pos == 0 {
            return None;
        }
        pos -= 1;
    }
}

fn reject_nul(text: &str) -> Result<(), SegmentError> {
    match text.chars().position(|c| c == '\0') {
        Some(offset) => Err(SegmentError::NulCharacter { offset }),
        None => Ok(()),
    }
}
