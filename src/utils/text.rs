use crate::constants::limits::COMMAND_PREVIEW_LENGTH;

pub fn truncate_utf8_prefix(value: &str, max_bytes: usize) -> String {
    if max_bytes == 0 {
        return String::new();
    }
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Single-line, length-capped rendering of a command for log lines.
pub fn command_preview(command: &str) -> String {
    let flat = command.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= COMMAND_PREVIEW_LENGTH {
        return flat;
    }
    format!("{}...", truncate_utf8_prefix(&flat, COMMAND_PREVIEW_LENGTH))
}

/// Lossy UTF-8 decode of captured bytes, marking output dropped past the cap.
pub fn render_capture(captured: &[u8], total_bytes: usize) -> String {
    let mut text = String::from_utf8_lossy(captured).into_owned();
    if total_bytes > captured.len() {
        text.push_str("\n[output truncated]");
    }
    text
}
