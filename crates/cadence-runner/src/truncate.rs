//! Bounding captured stderr before it is stored.
//!
//! A chatty task can print megabytes to stderr; the execution record keeps the
//! beginning (what the task was doing) and the end (how it failed).

/// Characters of stderr kept per execution record.
pub const MAX_STDERR_CHARS: usize = 64 * 1024;

/// Truncate `text` to at most `max_chars` characters by omitting the middle.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_owned();
    }

    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }

    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(total - half).collect();
    let omitted = total - 2 * half;

    format!("{head}\n[... {omitted} characters of stderr omitted ...]\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_untouched() {
        assert_eq!(truncate_middle("boom\n", 100), "boom\n");
    }

    #[test]
    fn keeps_both_ends() {
        let text = format!("{}{}", "a".repeat(50), "z".repeat(50));
        let out = truncate_middle(&text, 20);
        assert!(out.starts_with(&"a".repeat(10)));
        assert!(out.ends_with(&"z".repeat(10)));
        assert!(out.contains("80 characters of stderr omitted"));
    }

    #[test]
    fn multibyte_boundaries_are_safe() {
        let text = "é".repeat(40);
        let out = truncate_middle(&text, 10);
        assert!(out.starts_with("ééééé\n"));
    }
}
