//! Output comparison and failure messages
//!
//! **Normalization Rules:**
//! - Trim leading and trailing whitespace
//! - Removes differences in trailing line endings (\r\n vs \n)
//!
//! **Preserves:**
//! - Internal whitespace
//! - Case sensitivity
//! - Empty lines within content

/// Longest excerpt of received/expected output quoted in a wrong-answer message
pub const MAX_ECHOED_OUTPUT_CHARS: usize = 200;

pub fn normalize_output(output: &str) -> &str {
    output.trim()
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

pub fn wrong_answer_message(test_number: u32, actual: &str, expected: &str) -> String {
    format!(
        "Wrong answer on test {}: received {:?}, expected {:?}",
        test_number,
        truncate_chars(normalize_output(actual), MAX_ECHOED_OUTPUT_CHARS),
        truncate_chars(normalize_output(expected), MAX_ECHOED_OUTPUT_CHARS),
    )
}

pub fn time_limit_message(test_number: u32) -> String {
    format!("Time limit exceeded on test {}", test_number)
}

pub fn memory_limit_message(test_number: u32) -> String {
    format!("Memory limit exceeded on test {}", test_number)
}

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}
