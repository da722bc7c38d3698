use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, CoreBPE};

/// Chunk sizing rules. Defaults follow the indexing contract: 200–500 token
/// segments with at most 10% overlap between neighbors.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub max_overlap_fraction: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: 200,
            max_tokens: 500,
            max_overlap_fraction: 0.1,
        }
    }
}

impl ChunkingConfig {
    fn max_overlap_tokens(&self) -> usize {
        (self.max_tokens as f32 * self.max_overlap_fraction).floor() as usize
    }
}

/// A text segment with byte offsets into the source document.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub start: usize,
    pub end: usize,
    pub token_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sentence {
    start: usize,
    end: usize,
    tokens: usize,
}

/// Split `text` into chunks that respect sentence boundaries where
/// `sentence_ends` provides them. A sentence longer than the token ceiling is
/// split on token windows as a last resort.
pub fn chunk_text(text: &str, sentence_ends: &[usize], config: &ChunkingConfig) -> Vec<TextChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let sentences = collect_sentences(text, sentence_ends);
    if sentences.is_empty() {
        return Vec::new();
    }

    let max_overlap = config.max_overlap_tokens();
    let mut chunks: Vec<TextChunk> = Vec::new();
    let mut current: Vec<Sentence> = Vec::new();
    let mut current_tokens = 0usize;

    for sentence in sentences {
        if sentence.tokens > config.max_tokens {
            // Flush whatever is pending, then hard-split the oversized
            // sentence on token windows.
            flush_chunk(text, &mut current, &mut current_tokens, &mut chunks);
            chunks.extend(split_span_by_tokens(
                text,
                sentence.start,
                sentence.end,
                config.max_tokens,
            ));
            continue;
        }

        if current_tokens + sentence.tokens > config.max_tokens && !current.is_empty() {
            let mut overlap_seed = trailing_overlap(&current, max_overlap);
            let seed_tokens: usize = overlap_seed.iter().map(|seed| seed.tokens).sum();
            if seed_tokens + sentence.tokens > config.max_tokens {
                // Overlap never buys the right to exceed the ceiling.
                overlap_seed.clear();
            }

            flush_chunk(text, &mut current, &mut current_tokens, &mut chunks);
            for carried in overlap_seed {
                current_tokens += carried.tokens;
                current.push(carried);
            }
        }

        current_tokens += sentence.tokens;
        current.push(sentence);
    }

    flush_chunk(text, &mut current, &mut current_tokens, &mut chunks);
    merge_small_tail(text, &mut chunks, config);

    chunks
}

fn collect_sentences(text: &str, sentence_ends: &[usize]) -> Vec<Sentence> {
    let mut boundaries: Vec<usize> = sentence_ends
        .iter()
        .copied()
        .filter(|end| *end > 0 && *end <= text.len() && text.is_char_boundary(*end))
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();
    if boundaries.last() != Some(&text.len()) {
        boundaries.push(text.len());
    }

    let mut sentences = Vec::new();
    let mut start = 0usize;
    for end in boundaries {
        if end <= start {
            continue;
        }

        let slice = &text[start..end];
        if slice.trim().is_empty() {
            start = end;
            continue;
        }

        sentences.push(Sentence {
            start,
            end,
            tokens: count_tokens(slice),
        });
        start = end;
    }

    sentences
}

fn flush_chunk(
    text: &str,
    current: &mut Vec<Sentence>,
    current_tokens: &mut usize,
    chunks: &mut Vec<TextChunk>,
) {
    if current.is_empty() {
        return;
    }

    let start = current.first().map(|sentence| sentence.start).unwrap_or(0);
    let end = current.last().map(|sentence| sentence.end).unwrap_or(start);
    current.clear();
    *current_tokens = 0;

    if start >= end {
        return;
    }

    chunks.push(TextChunk {
        start,
        end,
        token_count: count_tokens(&text[start..end]),
    });
}

/// Trailing sentences of the finished chunk that seed the next one, bounded
/// by the overlap budget. Never carries the whole chunk forward.
fn trailing_overlap(current: &[Sentence], max_overlap_tokens: usize) -> Vec<Sentence> {
    if max_overlap_tokens == 0 || current.len() < 2 {
        return Vec::new();
    }

    let mut carried = Vec::new();
    let mut budget = max_overlap_tokens;
    for sentence in current.iter().rev() {
        if carried.len() + 1 >= current.len() || sentence.tokens > budget {
            break;
        }
        budget -= sentence.tokens;
        carried.push(*sentence);
    }

    carried.reverse();
    carried
}

fn split_span_by_tokens(text: &str, start: usize, end: usize, max_tokens: usize) -> Vec<TextChunk> {
    let slice = &text[start..end];
    let tokenizer = tokenizer();
    let tokens = tokenizer.encode_ordinary(slice);
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut token_start = 0usize;
    let mut byte_cursor = start;

    while token_start < tokens.len() {
        let mut token_end = usize::min(token_start + max_tokens, tokens.len());
        let mut decoded_len: Option<usize> = None;

        // Extend until the window decodes on a UTF-8 boundary.
        while token_end <= tokens.len() {
            match tokenizer.decode(tokens[token_start..token_end].to_vec()) {
                Ok(decoded) => {
                    decoded_len = Some(decoded.len());
                    break;
                }
                Err(_) if token_end < tokens.len() => token_end += 1,
                Err(_) => break,
            }
        }

        let Some(length) = decoded_len else {
            break;
        };

        let chunk_end = (byte_cursor + length).min(end);
        if chunk_end > byte_cursor {
            chunks.push(TextChunk {
                start: byte_cursor,
                end: chunk_end,
                token_count: token_end - token_start,
            });
        }

        byte_cursor = chunk_end;
        token_start = token_end;
    }

    chunks
}

/// A trailing fragment below the minimum merges into its neighbor when the
/// combined chunk still fits.
fn merge_small_tail(text: &str, chunks: &mut Vec<TextChunk>, config: &ChunkingConfig) {
    if chunks.len() < 2 {
        return;
    }

    let last = chunks[chunks.len() - 1].clone();
    if last.token_count >= config.min_tokens {
        return;
    }

    let previous = chunks[chunks.len() - 2].clone();
    let merged_tokens = count_tokens(&text[previous.start..last.end]);
    if merged_tokens > config.max_tokens {
        return;
    }

    chunks.pop();
    let merged_index = chunks.len() - 1;
    chunks[merged_index] = TextChunk {
        start: previous.start,
        end: last.end,
        token_count: merged_tokens,
    };
}

pub(crate) fn count_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| cl100k_base().expect("failed to initialize cl100k tokenizer"))
}

#[cfg(test)]
mod tests {
    use super::{chunk_text, count_tokens, ChunkingConfig};
    use crate::parser::detect_sentence_ends;

    fn small_config() -> ChunkingConfig {
        ChunkingConfig {
            min_tokens: 4,
            max_tokens: 12,
            max_overlap_fraction: 0.25,
        }
    }

    #[test]
    fn empty_text_produces_no_chunks() {
        assert!(chunk_text("", &[], &ChunkingConfig::default()).is_empty());
        assert!(chunk_text("   \n  ", &[], &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn short_text_stays_in_one_chunk() {
        let text = "One sentence here.";
        let chunks = chunk_text(text, &detect_sentence_ends(text), &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, text.len());
    }

    #[test]
    fn chunks_never_split_mid_sentence_when_boundaries_are_known() {
        let text = "Alpha beta gamma delta. Epsilon zeta eta theta. Iota kappa lambda mu. Nu xi omicron pi.";
        let ends = detect_sentence_ends(text);
        let chunks = chunk_text(text, &ends, &small_config());

        assert!(chunks.len() > 1, "text should split into multiple chunks");
        for chunk in &chunks {
            // Every chunk must end exactly on a sentence boundary.
            assert!(
                ends.contains(&chunk.end),
                "chunk end {} is not a sentence boundary",
                chunk.end
            );
        }
    }

    #[test]
    fn neighboring_chunks_overlap_within_budget() {
        let text = "Aa bb cc. Dd ee ff. Gg hh ii. Jj kk ll. Mm nn oo. Pp qq rr.";
        let config = small_config();
        let ends = detect_sentence_ends(text);
        let chunks = chunk_text(text, &ends, &config);

        assert!(chunks.len() >= 2);
        let overlap_budget = (config.max_tokens as f32 * config.max_overlap_fraction) as usize;
        for pair in chunks.windows(2) {
            assert!(pair[1].start <= pair[0].end, "chunks should be adjacent or overlap");
            if pair[1].start < pair[0].end {
                let overlap_tokens = count_tokens(&text[pair[1].start..pair[0].end]);
                assert!(
                    overlap_tokens <= overlap_budget,
                    "overlap of {overlap_tokens} tokens exceeds budget {overlap_budget}"
                );
            }
        }
    }

    #[test]
    fn oversized_sentence_is_token_split_without_losing_bytes() {
        let text = "word ".repeat(60);
        let text = text.trim_end();
        let chunks = chunk_text(text, &[text.len()], &small_config());

        assert!(chunks.len() > 1, "oversized sentence should split");
        assert_eq!(chunks.first().expect("first chunk").start, 0);
        assert_eq!(chunks.last().expect("last chunk").end, text.len());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "token split chunks must tile");
        }
    }

    #[test]
    fn small_tail_merges_into_previous_chunk() {
        let text = "Aa bb cc dd ee. Ff gg hh ii jj. Kk.";
        let ends = detect_sentence_ends(text);
        let config = ChunkingConfig {
            min_tokens: 4,
            max_tokens: 20,
            max_overlap_fraction: 0.0,
        };
        let chunks = chunk_text(text, &ends, &config);

        let last = chunks.last().expect("at least one chunk");
        assert_eq!(last.end, text.len());
        assert!(
            chunks.iter().all(|chunk| chunk.token_count >= config.min_tokens || chunks.len() == 1),
            "no undersized fragment should survive when a merge is legal"
        );
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "한글 텍스트 조각 ".repeat(40);
        let text = text.trim_end();
        let chunks = chunk_text(text, &[text.len()], &small_config());

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(text.is_char_boundary(chunk.start));
            assert!(text.is_char_boundary(chunk.end));
        }
    }
}
