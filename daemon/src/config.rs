//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::engines::CaptureConstraints;
use crate::wake::{WakePhraseError, WakeWordMatcher};

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Voice turn behaviour
    pub assistant: AssistantConfig,
}

/// Settings for the voice turn state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantConfig {
    /// Words that may precede the anchor word, e.g. `ok`, `okay`
    pub wake_keywords: Vec<String>,
    /// Word that completes the wake phrase
    pub wake_anchor: String,
    pub timeouts: Timeouts,
    pub capture: CaptureConstraints,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            wake_keywords: vec!["ok".to_string(), "okay".to_string()],
            wake_anchor: "metallica".to_string(),
            timeouts: Timeouts::default(),
            capture: CaptureConstraints::default(),
        }
    }
}

impl AssistantConfig {
    /// Compile the configured wake phrase
    pub fn wake_matcher(&self) -> Result<WakeWordMatcher, WakePhraseError> {
        WakeWordMatcher::new(&self.wake_keywords, &self.wake_anchor)
    }
}

/// Endpoint timer durations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Guard after the wake phrase, cancelled once speech starts
    pub wake_silence: Duration,
    /// End-of-utterance silence once any speech was heard
    pub utterance_silence: Duration,
    /// End-of-utterance silence before any speech was heard
    pub no_speech_silence: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            wake_silence: Duration::from_millis(15000),
            utterance_silence: Duration::from_millis(1700),
            no_speech_silence: Duration::from_millis(5000),
        }
    }
}

impl Timeouts {
    /// End-of-utterance duration given whether speech has been heard
    pub fn end_of_utterance(&self, has_speech: bool) -> Duration {
        if has_speech {
            self.utterance_silence
        } else {
            self.no_speech_silence
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load configuration using `var` to look up environment values
    pub fn load_with<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match var("VOICETURN_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = var("HOME").context("HOME is not set")?;
                PathBuf::from(home)
                    .join(".local")
                    .join("share")
                    .join("voiceturn")
            }
        };

        let socket_path = var("VOICETURN_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let mut assistant = AssistantConfig::default();

        if let Some(keywords) = var("VOICETURN_WAKE_KEYWORDS") {
            assistant.wake_keywords = keywords
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }
        if let Some(anchor) = var("VOICETURN_WAKE_ANCHOR") {
            assistant.wake_anchor = anchor.trim().to_string();
        }

        let timeouts = &mut assistant.timeouts;
        if let Some(ms) = millis(&var, "VOICETURN_WAKE_SILENCE_MS")? {
            timeouts.wake_silence = ms;
        }
        if let Some(ms) = millis(&var, "VOICETURN_UTTERANCE_SILENCE_MS")? {
            timeouts.utterance_silence = ms;
        }
        if let Some(ms) = millis(&var, "VOICETURN_NO_SPEECH_SILENCE_MS")? {
            timeouts.no_speech_silence = ms;
        }

        assistant
            .wake_matcher()
            .context("invalid wake phrase")?;

        Ok(Self {
            socket_path,
            data_dir,
            assistant,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

fn millis<F>(var: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| format!("{key} must be a whole number of milliseconds, got {raw:?}"))
        })
        .transpose()
}
