//! Sentence-aware chunking for long content.
//!
//! Token counts are estimated at four characters per token. Content under the
//! target comes back as a single chunk.

/// One slice of the input. `start`/`end` are character offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub tokens: usize,
}

pub trait Chunker: Send + Sync {
    /// Split `text` into ordered chunks of roughly `target_tokens`, each
    /// carrying an `overlap` fraction of the previous one.
    fn chunk(&self, text: &str, target_tokens: usize, overlap: f64) -> Vec<Chunk>;
}

const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Splits on blank lines, then on sentence ends, and packs sentences greedily.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentenceChunker;

impl Chunker for SentenceChunker {
    fn chunk(&self, text: &str, target_tokens: usize, overlap: f64) -> Vec<Chunk> {
        let total = estimate_tokens(text);
        if total <= target_tokens || target_tokens == 0 {
            return vec![Chunk {
                text: text.to_string(),
                start: 0,
                end: text.chars().count(),
                tokens: total,
            }];
        }

        let target_chars = target_tokens * CHARS_PER_TOKEN;
        let overlap_chars = (target_chars as f64 * overlap.clamp(0.0, 0.9)).floor() as usize;

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_start = 0usize;
        // Character offset of the next sentence in the source text.
        let mut cursor = 0usize;

        for (offset, sentence) in sentences(text) {
            let candidate_len = current.chars().count()
                + usize::from(!current.is_empty())
                + sentence.chars().count();
            if candidate_len > target_chars && !current.is_empty() {
                let len = current.chars().count();
                chunks.push(Chunk {
                    tokens: estimate_tokens(&current),
                    start: current_start,
                    end: current_start + len,
                    text: std::mem::take(&mut current),
                });
                let tail = last_chars(&chunks[chunks.len() - 1].text, overlap_chars);
                current_start = offset.saturating_sub(tail.chars().count());
                if !tail.is_empty() {
                    current.push_str(&tail);
                    current.push(' ');
                }
                current.push_str(sentence);
            } else {
                if current.is_empty() {
                    current_start = offset;
                } else {
                    current.push(' ');
                }
                current.push_str(sentence);
            }
            cursor = offset + sentence.chars().count();
        }

        if !current.is_empty() {
            let len = current.chars().count();
            chunks.push(Chunk {
                tokens: estimate_tokens(&current),
                start: current_start,
                end: (current_start + len).max(cursor),
                text: current,
            });
        }
        chunks
    }
}

fn last_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}

/// Sentences with their character offsets. Paragraph breaks (two or more
/// newlines) and whitespace after `.`, `!` or `?` end a sentence.
fn sentences(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start_byte: Option<usize> = None;
    let mut start_char = 0usize;
    let mut prev: Option<char> = None;
    let mut newline_run = 0usize;

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    for (char_idx, &(byte_idx, c)) in chars.iter().enumerate() {
        if c == '\n' {
            newline_run += 1;
        } else if !c.is_whitespace() {
            newline_run = 0;
        }

        let boundary = c.is_whitespace()
            && (matches!(prev, Some('.') | Some('!') | Some('?')) || newline_run >= 2);
        if boundary {
            if let Some(s) = start_byte.take() {
                let piece = text[s..byte_idx].trim_end();
                if !piece.is_empty() {
                    out.push((start_char, piece));
                }
            }
        } else if start_byte.is_none() && !c.is_whitespace() {
            start_byte = Some(byte_idx);
            start_char = char_idx;
        }
        prev = Some(c);
    }
    if let Some(s) = start_byte {
        let piece = text[s..].trim_end();
        if !piece.is_empty() {
            out.push((start_char, piece));
        }
    }
    out
}

/// Element-wise mean of equal-length vectors. Empty input yields an empty vector.
pub fn average_vectors(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    if vectors.len() == 1 {
        return first.clone();
    }
    let mut out = vec![0.0f32; first.len()];
    for v in vectors {
        for (acc, x) in out.iter_mut().zip(v) {
            *acc += x;
        }
    }
    let scale = 1.0 / vectors.len() as f32;
    out.iter_mut().for_each(|x| *x *= scale);
    out
}
