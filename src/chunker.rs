//! Overlapping, boundary-aware text chunker.
//!
//! Splits extracted document text into fixed-size windows with overlap,
//! preferring to end each chunk on a natural boundary (paragraph, line,
//! sentence, clause) found near the end of the window. Offsets are in
//! characters, not bytes, so multi-byte text never splits mid-codepoint.

use crate::models::Chunk;

/// How far back from the end of a window to look for a natural break.
const BREAK_LOOKBACK: usize = 200;

/// Break candidates in priority order. The first separator found within the
/// lookback region wins; the chunk ends just after it.
const BREAK_POINTS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", ", ", "; ", " "];

/// Split `text` into overlapping chunks of at most `chunk_size` characters.
///
/// Consecutive chunks share `overlap` trailing/leading characters so that
/// content near a boundary is retrievable from either side. Progress is
/// guaranteed: each chunk starts strictly after the previous one, even for
/// degenerate inputs with no break points at all.
///
/// When `page_count` is known, each chunk is tagged with an estimated page
/// number assuming pages hold roughly equal amounts of text.
pub fn chunk_text(
    text: &str,
    page_count: Option<u32>,
    chunk_size: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total == 0 || chunk_size == 0 {
        return Vec::new();
    }

    let chars_per_page = page_count
        .filter(|&p| p > 0)
        .map(|p| (total / p as usize).max(1));

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut chunk_index = 0usize;

    while start < total {
        let mut end = (start + chunk_size).min(total);

        // Not the final chunk: pull the end back to a natural boundary if
        // one exists in the lookback region.
        if end < total {
            if let Some(break_end) = find_break(&chars, start, end) {
                end = break_end;
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            // Offsets refer to the trimmed span within the original text.
            let lead = piece.chars().take_while(|c| c.is_whitespace()).count();
            let trail = piece
                .chars()
                .rev()
                .take_while(|c| c.is_whitespace())
                .count();
            let start_char = start + lead;
            let end_char = end - trail;

            chunks.push(Chunk {
                chunk_index,
                text: trimmed.to_string(),
                start_char,
                end_char,
                page_number: chars_per_page.map(|cpp| (start_char / cpp) as u32 + 1),
            });
            chunk_index += 1;
        }

        if end >= total {
            break;
        }

        // Overlap the next window with the tail of this one, but always
        // advance by at least one character.
        let next_start = end.saturating_sub(overlap);
        start = if next_start > start { next_start } else { start + 1 };
    }

    chunks
}

/// Find the best break position in `chars[start..end]`, searching only the
/// last [`BREAK_LOOKBACK`] characters of the window. Returns the absolute
/// index just past the separator, or `None` if no separator occurs there.
fn find_break(chars: &[char], start: usize, end: usize) -> Option<usize> {
    let window_len = end - start;
    let lookback = BREAK_LOOKBACK.min(window_len);
    let search_from = end - lookback;
    let region: String = chars[search_from..end].iter().collect();

    for sep in BREAK_POINTS {
        if let Some(pos) = region.rfind(sep) {
            // rfind returns a byte offset into the region string; convert
            // back to a character count.
            let char_pos = region[..pos].chars().count();
            let break_end = search_from + char_pos + sep.chars().count();
            // A break at the very start of the window would make an empty
            // chunk; skip it.
            if break_end > start {
                return Some(break_end);
            }
        }
    }
    None
}
