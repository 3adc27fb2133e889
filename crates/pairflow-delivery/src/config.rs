use pairflow_core::ENVELOPE_ID_PREFIX;
use std::time::Duration;
use tracing::warn;

pub const DELIVERY_ATTEMPTS_ENV: &str = "PAIRFLOW_DELIVERY_ATTEMPTS";
pub const PROMPT_GLYPHS_ENV: &str = "PAIRFLOW_PROMPT_GLYPHS";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_SUBMIT_KEY: &str = "Enter";
pub const DEFAULT_PROMPT_GLYPHS: [&str; 3] = ["›", "❯", ">"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub settle_delay: Duration,
    pub verify_delay: Duration,
    pub retry_delay: Duration,
    pub submit_key: String,
    pub prompt_glyphs: Vec<String>,
    pub marker_prefix: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            settle_delay: Duration::from_millis(300),
            verify_delay: Duration::from_millis(1000),
            retry_delay: Duration::from_millis(500),
            submit_key: DEFAULT_SUBMIT_KEY.to_string(),
            prompt_glyphs: DEFAULT_PROMPT_GLYPHS.iter().map(|g| g.to_string()).collect(),
            marker_prefix: ENVELOPE_ID_PREFIX.to_string(),
        }
    }
}

impl DeliveryConfig {
    pub fn from_env() -> Self {
        Self::from_env_values(
            std::env::var(DELIVERY_ATTEMPTS_ENV).ok(),
            std::env::var(PROMPT_GLYPHS_ENV).ok(),
        )
    }

    pub fn from_env_values(attempts: Option<String>, glyphs: Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = attempts.filter(|value| !value.trim().is_empty()) {
            match raw.trim().parse::<u32>() {
                Ok(value) if value > 0 => config.max_attempts = value,
                _ => warn!(
                    event = "delivery_config_ignored",
                    key = DELIVERY_ATTEMPTS_ENV,
                    value = %raw,
                    "expected a positive integer"
                ),
            }
        }
        if let Some(raw) = glyphs {
            let parsed: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|glyph| !glyph.is_empty())
                .map(str::to_string)
                .collect();
            if !parsed.is_empty() {
                config.prompt_glyphs = parsed;
            }
        }
        config
    }

    /// Zero delays, for fakes and tests.
    pub fn immediate() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            verify_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}
