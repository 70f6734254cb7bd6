//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("\u{2705} ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("\u{274c} ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("\u{2728} ", "*");
pub static BLOCKER: Emoji<'_, '_> = Emoji("\u{1f6a7} ", "[BLOCK]");
pub static WARN: Emoji<'_, '_> = Emoji("\u{26a0}\u{fe0f}  ", "[!]");
pub static RETRY: Emoji<'_, '_> = Emoji("\u{1f504} ", "[RETRY]");
pub static QUESTION: Emoji<'_, '_> = Emoji("\u{2753} ", "[?]");

// Pipeline indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("\u{25b6}\u{fe0f}  ", "[>]");
pub static TRIGGER: Emoji<'_, '_> = Emoji("\u{1f30a} ", "[T]");
pub static CLOCK: Emoji<'_, '_> = Emoji("\u{23f1}\u{fe0f}  ", "[T]");
pub static STOP: Emoji<'_, '_> = Emoji("\u{23f9}\u{fe0f}  ", "[STOP]");
