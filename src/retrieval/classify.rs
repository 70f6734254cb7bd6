//! Response classification for sub-unit fetches.

use regex::Regex;
use std::sync::LazyLock;

use crate::checkpoint::SubUnitOutcome;

// Interstitials that come back as 200 but carry no content
static CHALLENGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)captcha|cf-chl|access denied|are you a robot|unusual traffic").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchClass {
    Ok,
    Blocked(String),
    Failed(String),
}

impl FetchClass {
    pub fn outcome(&self) -> SubUnitOutcome {
        match self {
            FetchClass::Ok => SubUnitOutcome::Processed,
            FetchClass::Blocked(_) => SubUnitOutcome::Blocked,
            FetchClass::Failed(_) => SubUnitOutcome::Failed,
        }
    }
}

pub fn classify_response(status: u16, body: &str) -> FetchClass {
    match status {
        401 | 403 | 429 => FetchClass::Blocked(format!("HTTP {}", status)),
        503 => FetchClass::Blocked("HTTP 503 (likely challenge)".to_string()),
        200..=299 if CHALLENGE_REGEX.is_match(body) => {
            FetchClass::Blocked("challenge page".to_string())
        }
        200..=299 => FetchClass::Ok,
        _ => FetchClass::Failed(format!("HTTP {}", status)),
    }
}
