//! Slash and text command detection

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Gateway-level command recognised in user text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Start a fresh agent session, optionally with a first prompt
    NewSession { remainder: String },
}

fn new_session_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)^new\b\s*(.*)$").expect("valid regex"))
}

/// Whether text is a slash command (`/compact`, not `/` or `//comment`)
pub fn is_slash_command(text: &str) -> bool {
    let text = text.trim();
    text.starts_with('/') && text.chars().count() > 1 && !text.starts_with("//")
}

/// Detect a gateway command in text.
///
/// `new` starts a new session; `new chat ...` and `new session ...` are
/// left alone so they can reach the agent as ordinary prompts.
pub fn resolve_command(text: &str) -> Option<GatewayCommand> {
    let captures = new_session_pattern().captures(text.trim())?;
    let remainder = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();

    let lower = remainder.to_lowercase();
    if lower.starts_with("chat") || lower.starts_with("session") {
        return None;
    }

    Some(GatewayCommand::NewSession {
        remainder: remainder.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slash_command_detection() {
        assert!(is_slash_command("/compact"));
        assert!(is_slash_command("  /model gpt "));
        assert!(!is_slash_command("/"));
        assert!(!is_slash_command("//comment"));
        assert!(!is_slash_command("hello /compact"));
        assert!(!is_slash_command(""));
    }

    #[test]
    fn test_new_session_command() {
        assert_eq!(
            resolve_command("new"),
            Some(GatewayCommand::NewSession {
                remainder: String::new()
            })
        );
        assert_eq!(
            resolve_command("New  fix the build"),
            Some(GatewayCommand::NewSession {
                remainder: "fix the build".to_string()
            })
        );
    }

    #[test]
    fn test_non_commands() {
        assert_eq!(resolve_command("new chat please"), None);
        assert_eq!(resolve_command("new Session"), None);
        assert_eq!(resolve_command("newer things"), None);
        assert_eq!(resolve_command("renew"), None);
        assert_eq!(resolve_command("hello"), None);
    }
}
