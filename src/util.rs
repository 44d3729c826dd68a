/// Facebook Messenger rejects text messages longer than this many characters.
pub const MESSENGER_TEXT_LIMIT: usize = 640;

/// Truncate `s` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Split `text` into chunks of at most `limit` characters.
///
/// Chunks break after the last space inside the window so words stay whole;
/// a word longer than `limit` is cut hard. Concatenating the chunks yields
/// the original text.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        let hard = rest
            .char_indices()
            .nth(limit)
            .map_or(rest.len(), |(idx, _)| idx);

        let cut = if rest[hard..].starts_with(' ') {
            hard
        } else {
            match rest[..hard].rfind(' ') {
                Some(space) => space + ' '.len_utf8(),
                None => hard,
            }
        };

        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
