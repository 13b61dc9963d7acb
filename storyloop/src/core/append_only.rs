//! Prefix rules for the append-only learnings ledger.

/// Check that `after` extends `before`.
///
/// Returns the appended suffix (possibly empty), or a description of the first
/// divergence when `before` is not a prefix of `after`.
pub fn appended_suffix<'a>(before: &str, after: &'a str) -> Result<&'a str, String> {
    if let Some(suffix) = after.strip_prefix(before) {
        return Ok(suffix);
    }
    if after.len() < before.len() && before.starts_with(after) {
        return Err(format!(
            "content shrank from {} to {} bytes",
            before.len(),
            after.len()
        ));
    }
    let line = before
        .lines()
        .zip(after.lines())
        .position(|(a, b)| a != b)
        .map(|idx| idx + 1)
        .unwrap_or_else(|| before.lines().count().min(after.lines().count()) + 1);
    Err(format!("existing content modified at line {line}"))
}

/// Last `max_bytes` of the ledger, cut on a line boundary.
pub fn tail(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut start = content.len() - max_bytes;
    while !content.is_char_boundary(start) {
        start += 1;
    }
    let window = &content[start..];
    if content.as_bytes()[start - 1] == b'\n' {
        return window;
    }
    match window.find('\n') {
        Some(idx) if idx + 1 < window.len() => &window[idx + 1..],
        _ => window,
    }
}

/// Render one ledger entry as a markdown bullet.
pub fn format_entry(text: &str) -> String {
    let mut lines = text.trim().lines();
    let mut out = String::new();
    if let Some(first) = lines.next() {
        out.push_str("- ");
        out.push_str(first.trim_end());
        out.push('\n');
    }
    for line in lines {
        out.push_str("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
