//! Keyword routing of free text to agents
//!
//! Text that starts with one of an agent's keywords (followed by a boundary
//! character) goes to that agent; anything else stays with the active agent,
//! or the default agent when nothing is active.

use crate::agent::runtime::AgentRuntime;
use std::sync::Arc;

/// Characters that may follow a keyword for it to count as a match
const BOUNDARY_CHARS: &[char] = &[
    ' ', '\t', '\n', ':', '：', ',', '，', '.', '。', '!', '！', '?', '？', '、', '-',
];

/// Separators stripped between the keyword and the rest of the text
const SEPARATOR_CHARS: &[char] = &[':', '：', ',', '，', '-'];

/// Outcome of routing one piece of text
#[derive(Debug, Clone)]
pub struct RouterResult {
    /// Agent that should handle the text, if any is available
    pub agent: Option<Arc<AgentRuntime>>,
    /// Text left after removing the matched keyword and separators
    pub remainder: String,
    /// Whether a keyword selected an agent other than the active one
    pub switched: bool,
}

fn is_boundary(next: Option<char>) -> bool {
    match next {
        None => true,
        Some(c) => BOUNDARY_CHARS.contains(&c),
    }
}

/// Resolve which agent `text` is addressed to.
///
/// Agents are checked in registration order; within an agent the longest
/// keyword is tried first. The first match wins.
pub fn resolve(
    text: &str,
    current_agent_id: Option<&str>,
    agents: &[Arc<AgentRuntime>],
    default_agent_id: Option<&str>,
) -> RouterResult {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();

    for agent in agents {
        let mut keywords: Vec<String> = agent
            .keywords()
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        keywords.sort_by_key(|k| std::cmp::Reverse(k.chars().count()));

        for keyword in &keywords {
            let Some(rest) = lower.strip_prefix(keyword.as_str()) else {
                continue;
            };
            if !is_boundary(rest.chars().next()) {
                continue;
            }

            let after: String = trimmed.chars().skip(keyword.chars().count()).collect();
            let remainder = after
                .trim_start_matches(|c: char| c.is_whitespace() || SEPARATOR_CHARS.contains(&c))
                .trim_end()
                .to_string();

            return RouterResult {
                switched: current_agent_id != Some(agent.id()),
                agent: Some(agent.clone()),
                remainder,
            };
        }
    }

    let find = |id: Option<&str>| id.and_then(|id| agents.iter().find(|a| a.id() == id));
    let agent = find(current_agent_id).or_else(|| find(default_agent_id)).cloned();

    RouterResult {
        agent,
        remainder: trimmed.to_string(),
        switched: false,
    }
}
