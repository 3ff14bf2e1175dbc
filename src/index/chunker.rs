//! Split a document into chunks with exact byte ranges.
//!
//! Blocks are separated by blank lines, and a heading always starts a new block. Blocks
//! are packed into chunks up to a token budget; an oversized block is split at sentence
//! ends, and an oversized sentence is hard-split on a char boundary. Every span is
//! trimmed of surrounding whitespace so `&text[span.start..span.end]` is the chunk text.

/// Rough chars-per-token ratio used for budgeting.
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough token estimate: ~4 chars per token.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

struct Block {
    span: Span,
    heading: bool,
}

/// Chunk `text[body_start..]`. Returned spans index into `text`.
pub fn chunk(text: &str, body_start: usize, max_tokens: usize) -> Vec<Span> {
    let max_bytes = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut spans = Vec::new();
    let mut current: Option<Span> = None;

    for block in blocks(text, body_start) {
        if block.span.len() > max_bytes {
            if let Some(c) = current.take() {
                spans.push(c);
            }
            spans.extend(split_block(text, block.span, max_bytes));
            continue;
        }
        current = match current {
            Some(c) if !block.heading && block.span.end - c.start <= max_bytes => Some(Span {
                start: c.start,
                end: block.span.end,
            }),
            Some(c) => {
                spans.push(c);
                Some(block.span)
            }
            None => Some(block.span),
        };
    }
    if let Some(c) = current {
        spans.push(c);
    }
    spans
}

fn blocks(text: &str, body_start: usize) -> Vec<Block> {
    let mut out = Vec::new();
    let mut current: Option<Block> = None;
    let mut pos = body_start;

    for line in text[body_start..].split_inclusive('\n') {
        let line_start = pos;
        pos += line.len();

        let content = line.trim_end_matches(['\n', '\r']);
        if content.trim().is_empty() {
            out.extend(current.take());
            continue;
        }
        let lead = content.len() - content.trim_start().len();
        let span = Span {
            start: line_start + lead,
            end: line_start + content.trim_end().len(),
        };

        if content.trim_start().starts_with('#') {
            out.extend(current.take());
            current = Some(Block {
                span,
                heading: true,
            });
        } else if let Some(block) = current.as_mut() {
            block.span.end = span.end;
        } else {
            current = Some(Block {
                span,
                heading: false,
            });
        }
    }
    out.extend(current);
    out
}

fn split_block(text: &str, block: Span, max_bytes: usize) -> Vec<Span> {
    let mut out = Vec::new();
    let mut current: Option<Span> = None;

    for sentence in sentences(text, block) {
        if sentence.len() > max_bytes {
            out.extend(current.take());
            out.extend(hard_split(text, sentence, max_bytes));
            continue;
        }
        current = match current {
            Some(c) if sentence.end - c.start <= max_bytes => Some(Span {
                start: c.start,
                end: sentence.end,
            }),
            Some(c) => {
                out.push(c);
                Some(sentence)
            }
            None => Some(sentence),
        };
    }
    out.extend(current);
    out
}

fn sentences(text: &str, block: Span) -> Vec<Span> {
    let s = &text[block.start..block.end];
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;

    for (i, ch) in s.char_indices() {
        let boundary = match ch {
            '.' | '!' | '?' => bytes
                .get(i + 1)
                .map_or(false, |b| b.is_ascii_whitespace()),
            '\n' => true,
            _ => false,
        };
        if boundary {
            let end = i + ch.len_utf8();
            out.extend(trimmed(text, block.start + start, block.start + end));
            start = end;
        }
    }
    out.extend(trimmed(text, block.start + start, block.end));
    out
}

fn hard_split(text: &str, span: Span, max_bytes: usize) -> Vec<Span> {
    let mut out = Vec::new();
    let mut start = span.start;
    while start < span.end {
        let mut end = (start + max_bytes).min(span.end);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single char wider than the budget.
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        out.extend(trimmed(text, start, end));
        start = end;
    }
    out
}

fn trimmed(text: &str, start: usize, end: usize) -> Option<Span> {
    let s = &text[start..end];
    let lead = s.len() - s.trim_start().len();
    let trail = s.len() - s.trim_end().len();
    let span = Span {
        start: start + lead,
        end: end - trail,
    };
    (span.start < span.end).then_some(span)
}
