//! Wake phrase detection over transcript text
//!
//! The matcher is a pure predicate: it holds a compiled pattern and
//! nothing else, so it can be called on every interim result.

use regex::{Regex, RegexBuilder};

/// Why a wake phrase could not be built
#[derive(Debug, thiserror::Error)]
pub enum WakePhraseError {
    #[error("wake phrase needs at least one keyword")]
    NoKeywords,

    #[error("wake phrase needs an anchor word")]
    NoAnchor,

    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

/// Matches a wake phrase of the form `<keyword> <anchor>`
///
/// Matching is case-insensitive and tolerates any run of non-letter
/// characters between the keyword and the anchor word, so `"ok, metallica"`,
/// `"OK metallica"` and `"okay...metallica"` all trigger.
#[derive(Debug, Clone)]
pub struct WakeWordMatcher {
    pattern: Regex,
}

impl WakeWordMatcher {
    /// Build a matcher from a set of keywords and the anchor word
    pub fn new<S: AsRef<str>>(keywords: &[S], anchor: &str) -> Result<Self, WakePhraseError> {
        let keywords = keywords
            .iter()
            .map(|k| k.as_ref().trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>();
        if keywords.is_empty() {
            return Err(WakePhraseError::NoKeywords);
        }
        let anchor = anchor.trim();
        if anchor.is_empty() {
            return Err(WakePhraseError::NoAnchor);
        }

        let pattern = format!(
            r"\b(?:{})[^\p{{L}}]*{}\b",
            keywords.join("|"),
            regex::escape(anchor)
        );
        Self::from_pattern(&pattern)
    }

    /// Build a matcher from a raw regular expression
    pub fn from_pattern(pattern: &str) -> Result<Self, WakePhraseError> {
        let pattern = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self { pattern })
    }

    /// Whether the text contains the wake phrase
    pub fn accepts(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> WakeWordMatcher {
        WakeWordMatcher::new(&["ok", "okay"], "metallica").unwrap()
    }

    #[test]
    fn test_plain_phrase() {
        assert!(matcher().accepts("ok metallica"));
        assert!(matcher().accepts("okay metallica what time is it"));
    }

    #[test]
    fn test_case_and_punctuation() {
        let m = matcher();
        assert!(m.accepts("OK, Metallica"));
        assert!(m.accepts("Okay... METALLICA!"));
        assert!(m.accepts("ok metallica "));
        assert!(m.accepts("well ok-metallica"));
    }

    #[test]
    fn test_rejects_partial_or_missing() {
        let m = matcher();
        assert!(!m.accepts("ok met"));
        assert!(!m.accepts("metallica"));
        assert!(!m.accepts("ok then metallica"));
        assert!(!m.accepts("bookmetallica"));
        assert!(!m.accepts(""));
    }

    #[test]
    fn test_split_across_interim_and_final() {
        // interim text followed by newly finalized text
        let joined = format!("{}{}", "ok ", "metallica");
        assert!(matcher().accepts(&joined));
    }

    #[test]
    fn test_custom_pattern() {
        let m = WakeWordMatcher::from_pattern(r"\bhey[^\p{L}]*jarvis\b").unwrap();
        assert!(m.accepts("Hey, Jarvis"));
        assert!(!m.accepts("ok metallica"));
    }

    #[test]
    fn test_empty_phrase_parts_rejected() {
        assert!(matches!(
            WakeWordMatcher::new(&[] as &[&str], "metallica"),
            Err(WakePhraseError::NoKeywords)
        ));
        assert!(matches!(
            WakeWordMatcher::new(&[" ", ""], "metallica"),
            Err(WakePhraseError::NoKeywords)
        ));
        assert!(matches!(
            WakeWordMatcher::new(&["ok"], "  "),
            Err(WakePhraseError::NoAnchor)
        ));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(WakeWordMatcher::from_pattern("(unclosed").is_err());
    }
}
