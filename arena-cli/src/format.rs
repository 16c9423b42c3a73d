//! Formatting utilities shared by the commands

/// Shorten `s` to at most `max` characters, marking the cut with ".."
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(2)).collect();
        format!("{}..", kept)
    }
}
