//! Prefix command parsing.
//!
//! `.PAIR 123456` with prefix `.` parses to name `pair`, args `["123456"]`.
//! Anything not starting with the prefix is not a command.

/// A command split out of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Lowercased command name without the prefix.
    pub name: String,
    /// Whitespace-separated arguments following the name.
    pub args: Vec<String>,
    /// The original raw input string.
    pub raw: String,
}

/// Parse `input` as a prefixed command.
///
/// Returns `None` for empty input, input without the prefix, or a bare
/// prefix.
pub fn parse_command(input: &str, prefix: &str) -> Option<ParsedCommand> {
    let trimmed = input.trim();
    if trimmed.is_empty() || prefix.is_empty() {
        return None;
    }

    let without_prefix = trimmed.strip_prefix(prefix)?;
    let mut parts = without_prefix.split_whitespace();
    let name = parts.next()?.to_lowercase();

    // ". ping" is chat, not a command.
    if without_prefix.starts_with(char::is_whitespace) {
        return None;
    }

    Some(ParsedCommand {
        name,
        args: parts.map(str::to_string).collect(),
        raw: input.to_string(),
    })
}
