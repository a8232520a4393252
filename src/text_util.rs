/// Default number of trailing words kept from a question.
pub const DEFAULT_MAX_WORDS: usize = 500;

/// Keywords that end the query loop, compared case-insensitively.
const EXIT_COMMANDS: [&str; 2] = ["exit", "quit"];

/// Keep only the last `max_words` whitespace-separated words of `text`,
/// joined by single spaces.
///
/// Whitespace is normalized even when nothing is dropped.
pub fn truncate_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.len().saturating_sub(max_words);
    words[start..].join(" ")
}

/// Returns `true` if the trimmed input is an exit keyword in any case.
pub fn is_exit_command(input: &str) -> bool {
    let trimmed = input.trim();
    EXIT_COMMANDS
        .iter()
        .any(|cmd| trimmed.eq_ignore_ascii_case(cmd))
}

/// Strip NUL and other control characters, keeping tab, newline and
/// carriage return.
pub fn sanitize_prompt(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}
