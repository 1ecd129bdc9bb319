//! Auto-reply guard.
//!
//! Decides whether a participant's transcript should trigger an NPC reply
//! without an explicit command. Checks, in order: floor, minimum length,
//! content safety, duplicate suppression, then the session and per-user
//! cooldowns (both timers use the same configured value and both must
//! have expired).
//!
//! A safety block must not poison the cooldown: the timestamps update
//! only when the verdict is `Reply`.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Cooldown floor regardless of configuration.
pub const MIN_COOLDOWN: Duration = Duration::from_secs(1);
/// Identical text inside this window is a voice-double-utterance.
const DUPLICATE_WINDOW_MS: i64 = 1_000;
const MIN_WORDS: usize = 2;
const MIN_CHARS: usize = 6;

const PROFANITY: &[&str] = &["shit", "fuck", "bitch", "asshole", "bastard", "dick"];

/// Digit runs shaped like phone/identifier numbers.
fn digit_run_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{3}[-.\s]?\d{2,3}[-.\s]?\d{4}").expect("static pattern"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    /// Route to an NPC reply.
    Reply,
    /// Say nothing; `reason` goes to the event log only.
    Silent { reason: &'static str },
    /// Content flagged — presenter gets a held-for-review nurse line.
    HeldForReview,
}

pub struct AutoReplyGuard {
    cooldown_ms: i64,
    last_session_reply: Option<DateTime<Utc>>,
    last_user_reply: HashMap<String, DateTime<Utc>>,
    last_text: Option<(String, DateTime<Utc>)>,
}

impl AutoReplyGuard {
    pub fn new(configured_cooldown: Duration) -> Self {
        let cooldown = configured_cooldown.max(MIN_COOLDOWN);
        Self {
            cooldown_ms: cooldown.as_millis() as i64,
            last_session_reply: None,
            last_user_reply: HashMap::new(),
            last_text: None,
        }
    }

    pub fn evaluate(
        &mut self,
        user_id: &str,
        text: &str,
        has_floor: bool,
        now: DateTime<Utc>,
    ) -> GuardVerdict {
        if !has_floor {
            return GuardVerdict::Silent {
                reason: "speaker does not hold the floor",
            };
        }

        let trimmed = text.trim();
        if trimmed.split_whitespace().count() < MIN_WORDS || trimmed.len() < MIN_CHARS {
            return GuardVerdict::Silent {
                reason: "utterance too short",
            };
        }

        if is_unsafe(trimmed) {
            return GuardVerdict::HeldForReview;
        }

        let normalized = trimmed.to_lowercase();
        if let Some((last, at)) = &self.last_text {
            if *last == normalized && (now - *at).num_milliseconds() <= DUPLICATE_WINDOW_MS {
                return GuardVerdict::Silent {
                    reason: "duplicate utterance",
                };
            }
        }

        // Both timers must have fully elapsed (strictly greater than the
        // cooldown: the boundary itself still blocks).
        let session_blocked = self
            .last_session_reply
            .map(|at| (now - at).num_milliseconds() <= self.cooldown_ms)
            .unwrap_or(false);
        let user_blocked = self
            .last_user_reply
            .get(user_id)
            .map(|at| (now - *at).num_milliseconds() <= self.cooldown_ms)
            .unwrap_or(false);
        if session_blocked || user_blocked {
            return GuardVerdict::Silent {
                reason: "cooldown active",
            };
        }

        self.last_session_reply = Some(now);
        self.last_user_reply.insert(user_id.to_string(), now);
        self.last_text = Some((normalized, now));
        GuardVerdict::Reply
    }

    /// Drop the per-user timer and dedup entry (used on disconnect).
    pub fn forget_user(&mut self, user_id: &str) {
        self.last_user_reply.remove(user_id);
    }
}

fn is_unsafe(text: &str) -> bool {
    let lower = text.to_lowercase();
    if PROFANITY.iter().any(|w| {
        lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == *w)
    }) {
        return true;
    }
    digit_run_pattern().is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn guard() -> AutoReplyGuard {
        AutoReplyGuard::new(Duration::from_secs(1))
    }

    #[test]
    fn one_word_or_short_text_is_silent() {
        let mut g = guard();
        let now = Utc::now();
        assert_eq!(
            g.evaluate("u1", "hello", true, now),
            GuardVerdict::Silent {
                reason: "utterance too short"
            }
        );
        assert_eq!(
            g.evaluate("u1", "hi ok", true, now),
            GuardVerdict::Silent {
                reason: "utterance too short"
            }
        );
        assert_eq!(
            g.evaluate("u1", "check vitals", true, now),
            GuardVerdict::Reply
        );
    }

    #[test]
    fn floorless_speaker_is_silent() {
        let mut g = guard();
        assert!(matches!(
            g.evaluate("u1", "give adenosine now", false, Utc::now()),
            GuardVerdict::Silent { .. }
        ));
    }

    #[test]
    fn cooldown_boundary_plus_one_ms_passes() {
        let mut g = guard();
        let t0 = Utc::now();
        assert_eq!(g.evaluate("u1", "check the vitals", true, t0), GuardVerdict::Reply);

        // Exactly at the boundary: still blocked.
        let at_boundary = t0 + ChronoDuration::milliseconds(1000);
        assert!(matches!(
            g.evaluate("u1", "push the fluids", true, at_boundary),
            GuardVerdict::Silent { .. }
        ));

        // One millisecond later: allowed.
        let past = t0 + ChronoDuration::milliseconds(1001);
        assert_eq!(g.evaluate("u1", "push the fluids", true, past), GuardVerdict::Reply);
    }

    #[test]
    fn per_user_and_session_timers_are_both_checked() {
        let mut g = guard();
        let t0 = Utc::now();
        assert_eq!(g.evaluate("u1", "check the vitals", true, t0), GuardVerdict::Reply);

        // Different user, same session, inside the session cooldown.
        let t_half = t0 + ChronoDuration::milliseconds(500);
        assert!(matches!(
            g.evaluate("u2", "listen to lungs", true, t_half),
            GuardVerdict::Silent { .. }
        ));
    }

    #[test]
    fn duplicate_within_a_second_is_silent() {
        let mut g = guard();
        let t0 = Utc::now();
        assert_eq!(g.evaluate("u1", "order an ekg", true, t0), GuardVerdict::Reply);
        let t1 = t0 + ChronoDuration::milliseconds(900);
        assert!(matches!(
            g.evaluate("u1", "Order an EKG", true, t1),
            GuardVerdict::Silent { .. }
        ));
    }

    #[test]
    fn profanity_is_held_and_does_not_touch_cooldown() {
        let mut g = guard();
        let t0 = Utc::now();
        assert_eq!(g.evaluate("u1", "This is shit", true, t0), GuardVerdict::HeldForReview);

        // A safe utterance half a second later is NOT cooldown-blocked by
        // the held one.
        let t1 = t0 + ChronoDuration::milliseconds(500);
        assert_eq!(g.evaluate("u1", "sorry, check vitals", true, t1), GuardVerdict::Reply);
    }

    #[test]
    fn digit_runs_are_held() {
        let mut g = guard();
        let now = Utc::now();
        assert_eq!(
            g.evaluate("u1", "call me at 555-123-4567 please", true, now),
            GuardVerdict::HeldForReview
        );
        assert_eq!(
            g.evaluate("u1", "my number is 555 12 4567 ok", true, now),
            GuardVerdict::HeldForReview
        );
    }

    #[test]
    fn profanity_matches_whole_words_only() {
        let mut g = guard();
        let now = Utc::now();
        // "mississippi" contains no profane token.
        assert_eq!(
            g.evaluate("u1", "ship it to mississippi", true, now),
            GuardVerdict::Reply
        );
    }
}
