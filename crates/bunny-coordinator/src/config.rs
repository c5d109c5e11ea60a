//! Coordinator configuration.

use std::time::Duration;

use bunny_client::{DEFAULT_API_URL, DEFAULT_CTX_SIZE, DEFAULT_INFERENCE_PORT};

/// Default system prompt prepended to every chat payload.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Configuration for the session coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Base URL of the control-plane API
    pub api_url: String,
    /// Port the inference server is started on
    pub port: u16,
    /// Context size passed to the inference server
    pub ctx_size: u32,
    /// Maximum tokens per reply
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// System prompt; empty disables it
    pub system_prompt: String,
    /// How often `/server/status` is polled
    pub status_interval: Duration,
    /// How often `/downloads/active` is polled
    pub jobs_interval: Duration,
    /// Characters appended per typewriter tick
    pub typewriter_slice: usize,
    /// Typewriter tick period
    pub typewriter_tick: Duration,
    /// Pause between stopping and restarting the server
    pub stop_settle: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            port: DEFAULT_INFERENCE_PORT,
            ctx_size: DEFAULT_CTX_SIZE,
            max_tokens: 256,
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            status_interval: Duration::from_secs(2),
            jobs_interval: Duration::from_secs(1),
            typewriter_slice: 4,
            typewriter_tick: Duration::from_millis(16),
            stop_settle: Duration::from_millis(400),
        }
    }
}

impl CoordinatorConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let lookup = &lookup;

        Self {
            api_url: lookup("BUNNY_API_URL").unwrap_or(defaults.api_url),
            port: parsed(lookup, "BUNNY_INFERENCE_PORT").unwrap_or(defaults.port),
            ctx_size: parsed(lookup, "BUNNY_CTX_SIZE").unwrap_or(defaults.ctx_size),
            max_tokens: parsed(lookup, "BUNNY_MAX_TOKENS").unwrap_or(defaults.max_tokens),
            temperature: parsed(lookup, "BUNNY_TEMPERATURE").unwrap_or(defaults.temperature),
            system_prompt: lookup("BUNNY_SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
            ..defaults
        }
    }

    /// Create a builder for configuration.
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Builder for coordinator configuration.
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Start from an existing configuration, e.g. one read from the environment.
    pub fn from_config(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn ctx_size(mut self, ctx_size: u32) -> Self {
        self.config.ctx_size = ctx_size;
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.max_tokens = tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = temperature;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.config.status_interval = interval;
        self
    }

    pub fn jobs_interval(mut self, interval: Duration) -> Self {
        self.config.jobs_interval = interval;
        self
    }

    /// Typewriter pacing. A zero slice is treated as one character.
    pub fn typewriter(mut self, slice: usize, tick: Duration) -> Self {
        self.config.typewriter_slice = slice.max(1);
        self.config.typewriter_tick = tick;
        self
    }

    pub fn stop_settle(mut self, delay: Duration) -> Self {
        self.config.stop_settle = delay;
        self
    }

    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}
