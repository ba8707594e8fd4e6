//! Heuristic anti-spam detection run ahead of the rate limit strategies.

mod detector;
mod rules;

pub use detector::{SpamDetector, SpamVerdict};
pub use rules::{AntiSpamConfig, AntiSpamRule, PayloadSignature, SignatureConfig, SpamPattern};
