//! Sentinel token scanning.
//!
//! The only contract with the executor's transcript: a case-sensitive
//! substring search for the stage's done and blocked tokens. When both
//! appear, the earliest occurrence wins.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Completed,
    Blocked,
    /// Neither token present; the run is ambiguous
    None,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Completed => "completed",
            Signal::Blocked => "blocked",
            Signal::None => "none",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn scan(text: &str, done_token: &str, blocked_token: &str) -> Signal {
    let done = text.find(done_token);
    let blocked = text.find(blocked_token);
    match (done, blocked) {
        (Some(d), Some(b)) if b < d => Signal::Blocked,
        (Some(_), _) => Signal::Completed,
        (None, Some(_)) => Signal::Blocked,
        (None, None) => Signal::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DONE: &str = "RETRIEVAL_DONE";
    const BLOCKED: &str = "RETRIEVAL_BLOCKED";

    #[test]
    fn test_scan_single_tokens() {
        assert_eq!(scan("all good RETRIEVAL_DONE", DONE, BLOCKED), Signal::Completed);
        assert_eq!(scan("captcha wall\nRETRIEVAL_BLOCKED", DONE, BLOCKED), Signal::Blocked);
        assert_eq!(scan("still working", DONE, BLOCKED), Signal::None);
    }

    #[test]
    fn test_first_match_wins() {
        assert_eq!(
            scan("RETRIEVAL_BLOCKED ... later RETRIEVAL_DONE", DONE, BLOCKED),
            Signal::Blocked
        );
        assert_eq!(
            scan("RETRIEVAL_DONE then RETRIEVAL_BLOCKED", DONE, BLOCKED),
            Signal::Completed
        );
    }

    #[test]
    fn test_scan_is_case_sensitive() {
        assert_eq!(scan("retrieval_done", DONE, BLOCKED), Signal::None);
    }

    #[test]
    fn test_tokens_of_other_stages_ignored() {
        assert_eq!(scan("DISCOVERY_DONE", DONE, BLOCKED), Signal::None);
    }
}
