//! Streaming token assembler
//!
//! Turns the raw byte pieces produced for each sampled token into text
//! increments a caller can display right away. Two concerns are handled
//! independently:
//!
//! * UTF-8 boundary repair: a token may end in the middle of a multi-byte
//!   character, so trailing bytes are carried over to the next piece.
//! * Stop-marker detection: role delimiters such as `<|im_end|>` are often
//!   split over several tokens. The assembler scans a bounded window of recent
//!   output for complete markers and holds back any suffix that could still
//!   grow into one, so a marker never leaks into the sink.

use serde::{Deserialize, Serialize};

/// Size of the trailing window scanned for stop markers, in bytes.
pub const STOP_WINDOW: usize = 50;

/// ChatML role delimiters that terminate generation.
pub const CHATML_STOP_MARKERS: &[&str] = &["<|im_end|>", "<|im_start|>", "<|endoftext|>"];

/// Distinguishing prefixes stripped from the final text if a marker fragment
/// survived until the end of generation.
pub const CHATML_RESIDUAL_PREFIXES: &[&str] = &["<|im_", "<|endoftext"];

/// Expected length of a UTF-8 sequence starting with `lead`, or `None` if the
/// byte can never start a character.
fn sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}

/// Whether `byte` may appear at position `index` (1-based) of a sequence
/// started by `lead`. Rejects overlong forms, surrogates and code points
/// above U+10FFFF.
fn is_valid_continuation(lead: u8, index: usize, byte: u8) -> bool {
    let range = match (lead, index) {
        (0xE0, 1) => 0xA0..=0xBF,
        (0xED, 1) => 0x80..=0x9F,
        (0xF0, 1) => 0x90..=0xBF,
        (0xF4, 1) => 0x80..=0x8F,
        _ => 0x80..=0xBF,
    };
    range.contains(&byte)
}

/// Decodes the longest valid prefix of `bytes`.
///
/// Returns the decoded text and the offset where a character truncated by the
/// end of the buffer begins (`bytes.len()` when nothing is truncated). Bytes
/// that can never belong to a valid character are skipped one at a time.
pub fn scan_utf8(bytes: &[u8]) -> (String, usize) {
    let mut text = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let lead = bytes[i];
        let Some(len) = sequence_len(lead) else {
            i += 1;
            continue;
        };

        let available = len.min(bytes.len() - i);
        let well_formed = (1..available).all(|k| is_valid_continuation(lead, k, bytes[i + k]));
        if !well_formed {
            i += 1;
            continue;
        }

        if available < len {
            // Not enough bytes yet; the rest may arrive with the next piece.
            return (text, i);
        }

        match std::str::from_utf8(&bytes[i..i + len]) {
            Ok(ch) => {
                text.push_str(ch);
                i += len;
            }
            Err(_) => i += 1,
        }
    }

    (text, bytes.len())
}

/// Lossy conversion that drops invalid bytes and any truncated trailing
/// character.
pub fn make_valid_utf8(bytes: &[u8]) -> String {
    scan_utf8(bytes).0
}

/// Incremental UTF-8 decoder with a carry buffer for split characters.
///
/// Feeding a byte stream in any number of chunks yields the same total text
/// as decoding it in one go.
#[derive(Debug, Default, Clone)]
pub struct Utf8Repair {
    carry: Vec<u8>,
}

impl Utf8Repair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every character that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let (text, held) = scan_utf8(&self.carry);
        self.carry.drain(..held);
        text
    }

    /// Bytes waiting for the rest of their character.
    pub fn pending(&self) -> &[u8] {
        &self.carry
    }

    /// Discards whatever is still held. Returns the number of dropped bytes.
    pub fn finish(&mut self) -> usize {
        let dropped = self.carry.len();
        if dropped > 0 {
            tracing::debug!("Dropping {} bytes of an incomplete UTF-8 sequence", dropped);
        }
        self.carry.clear();
        dropped
    }
}

/// Length of the longest suffix of `pending` that is a proper prefix of
/// `marker`.
pub fn holdback_len(pending: &[u8], marker: &[u8]) -> usize {
    let max = pending.len().min(marker.len().saturating_sub(1));
    (1..=max)
        .rev()
        .find(|&k| pending.ends_with(&marker[..k]))
        .unwrap_or(0)
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Text patterns that end generation independently of the model's own
/// end-of-generation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopMarkers {
    markers: Vec<String>,
    residual_prefixes: Vec<String>,
}

impl StopMarkers {
    /// Builds a marker set. Empty patterns are ignored.
    pub fn new<M, R>(markers: M, residual_prefixes: R) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|m: &String| !m.is_empty())
                .collect(),
            residual_prefixes: residual_prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    /// The ChatML delimiter set.
    pub fn chatml() -> Self {
        Self::new(
            CHATML_STOP_MARKERS.iter().copied(),
            CHATML_RESIDUAL_PREFIXES.iter().copied(),
        )
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    pub fn residual_prefixes(&self) -> &[String] {
        &self.residual_prefixes
    }

    /// Length in bytes of the longest marker.
    pub fn longest(&self) -> usize {
        self.markers.iter().map(String::len).max().unwrap_or(0)
    }

    /// Earliest complete marker in `haystack`, as `(offset, marker)`.
    pub fn find(&self, haystack: &[u8]) -> Option<(usize, &str)> {
        self.markers
            .iter()
            .filter_map(|m| find_bytes(haystack, m.as_bytes()).map(|pos| (pos, m.as_str())))
            .min_by_key(|(pos, _)| *pos)
    }

    /// Number of trailing bytes of `pending` that must not be flushed yet
    /// because they could be the start of a marker.
    pub fn holdback(&self, pending: &[u8]) -> usize {
        self.markers
            .iter()
            .map(|m| holdback_len(pending, m.as_bytes()))
            .max()
            .unwrap_or(0)
    }

    /// Offset of the first residual marker fragment in `text`, if any.
    pub fn residual_cut(&self, text: &[u8]) -> Option<usize> {
        self.residual_prefixes
            .iter()
            .filter_map(|p| find_bytes(text, p.as_bytes()))
            .min()
    }
}

impl Default for StopMarkers {
    fn default() -> Self {
        Self::chatml()
    }
}

/// Result of feeding one token piece to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// A non-empty, valid text increment ready for the sink
    Text(String),
    /// Nothing can be released yet
    Pending,
    /// A stop marker completed; the accumulated text was truncated before it
    Stop { marker: String },
}

/// Tail of a finished assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    /// Text that was still held back and must reach the sink
    pub tail: Option<String>,
    /// Full generated text with markers and fragments removed
    pub text: String,
}

/// Accumulates token pieces for one generation.
///
/// `result[..flushed]` has been handed to the UTF-8 repair step; the rest is
/// pending and may still turn out to be a stop marker.
#[derive(Debug)]
pub struct StreamAssembler {
    markers: StopMarkers,
    result: Vec<u8>,
    flushed: usize,
    utf8: Utf8Repair,
}

impl StreamAssembler {
    pub fn new(markers: StopMarkers) -> Self {
        Self {
            markers,
            result: Vec::new(),
            flushed: 0,
            utf8: Utf8Repair::new(),
        }
    }

    /// Feeds the raw bytes of one token.
    pub fn push(&mut self, piece: &[u8]) -> Assembled {
        let window = STOP_WINDOW.max(self.markers.longest());
        let window_start = self.result.len().saturating_sub(window);
        self.result.extend_from_slice(piece);

        if let Some((offset, marker)) = self.markers.find(&self.result[window_start..]) {
            let marker = marker.to_string();
            let cut = (window_start + offset).max(self.flushed);
            self.result.truncate(cut);
            tracing::debug!("Stop marker {:?} detected at byte {}", marker, cut);
            return Assembled::Stop { marker };
        }

        let hold = self.markers.holdback(&self.result[self.flushed..]);
        let end = self.result.len() - hold;
        let text = self.utf8.push(&self.result[self.flushed..end]);
        self.flushed = end;

        if text.is_empty() {
            Assembled::Pending
        } else {
            Assembled::Text(text)
        }
    }

    /// Bytes accumulated so far, including held-back ones.
    pub fn len(&self) -> usize {
        self.result.len()
    }

    pub fn is_empty(&self) -> bool {
        self.result.is_empty()
    }

    /// Releases held-back text and produces the final string.
    pub fn finish(mut self) -> Finished {
        if let Some(cut) = self.markers.residual_cut(&self.result) {
            tracing::debug!("Stripping residual marker fragment at byte {}", cut);
            self.result.truncate(cut);
        }

        let tail = if self.result.len() > self.flushed {
            self.utf8.push(&self.result[self.flushed..])
        } else {
            String::new()
        };
        self.flushed = self.result.len();
        self.utf8.finish();

        Finished {
            tail: (!tail.is_empty()).then_some(tail),
            text: make_valid_utf8(&self.result),
        }
    }
}
