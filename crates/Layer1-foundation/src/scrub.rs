//! Secret scrubbing for agent output
//!
//! Anything the agent prints passes through a [`SecretScrubber`] before it is
//! forwarded or captured, so injected secret values never leave the runner.

use std::sync::Arc;

/// Replacement text for a scrubbed value
pub const REDACTED: &str = "[REDACTED]";

/// Values shorter than this are not scrubbed (too many false positives)
pub const MIN_SECRET_LEN: usize = 4;

/// Replaces known secret values in text
#[derive(Clone, Default)]
pub struct SecretScrubber {
    /// Longest first, so a secret that contains another is replaced whole
    secrets: Arc<Vec<String>>,
}

impl SecretScrubber {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut secrets: Vec<String> = values
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        secrets.dedup();
        Self {
            secrets: Arc::new(secrets),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Scrub a line of text
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in self.secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    /// True if any known secret occurs in `text`
    pub fn contains_secret(&self, text: &str) -> bool {
        self.secrets.iter().any(|s| text.contains(s.as_str()))
    }
}

impl std::fmt::Debug for SecretScrubber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretScrubber")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_replaces_all_occurrences() {
        let scrubber = SecretScrubber::new(["ghp_abcdef"]);
        assert_eq!(
            scrubber.scrub("token=ghp_abcdef again ghp_abcdef"),
            "token=[REDACTED] again [REDACTED]"
        );
    }

    #[test]
    fn test_longest_secret_first() {
        let scrubber = SecretScrubber::new(["abcd", "abcdefgh"]);
        assert_eq!(scrubber.scrub("x abcdefgh y"), "x [REDACTED] y");
    }

    #[test]
    fn test_short_values_ignored() {
        let scrubber = SecretScrubber::new(["", "ab"]);
        assert!(scrubber.is_empty());
        assert_eq!(scrubber.scrub("ab"), "ab");
    }

    #[test]
    fn test_debug_hides_values() {
        let scrubber = SecretScrubber::new(["sk-real-key"]);
        assert!(!format!("{:?}", scrubber).contains("sk-real-key"));
    }

    #[test]
    fn test_contains_secret() {
        let scrubber = SecretScrubber::new(["sk-real-key"]);
        assert!(scrubber.contains_secret("{\"key\":\"sk-real-key\"}"));
        assert!(!scrubber.contains_secret("nothing here"));
    }
}
