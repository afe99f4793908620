use crate::config::ChunkMode;

/// Split `text` into chunks of at most `limit` characters.
///
/// Returns no chunks for empty text or a zero limit.
pub fn chunk_text(text: &str, limit: usize, mode: ChunkMode) -> Vec<String> {
    if limit == 0 || text.trim().is_empty() {
        return Vec::new();
    }
    match mode {
        ChunkMode::Length => chunk_by_length(text, limit),
        ChunkMode::Newline => chunk_by_paragraph(text, limit),
    }
}

/// Fill chunks up to `limit`, splitting at the last newline or space inside
/// the window when there is one.
fn chunk_by_length(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((window_end, _)) = remaining.char_indices().nth(limit) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..window_end];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|pos| *pos > 0)
            .unwrap_or(window_end);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start_matches('\n');
        if let Some(rest) = remaining.strip_prefix(' ') {
            remaining = rest;
        }
    }

    chunks
}

/// Pack whole paragraphs into chunks; paragraphs longer than `limit` fall
/// back to length splitting.
fn chunk_by_paragraph(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for para in text
        .split("\n\n")
        .map(|p| p.trim_matches('\n'))
        .filter(|p| !p.trim().is_empty())
    {
        let para_len = para.chars().count();
        if para_len > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            chunks.extend(chunk_by_length(para, limit));
            continue;
        }

        if !current.is_empty() && current_len + 2 + para_len > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
