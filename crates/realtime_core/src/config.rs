use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use shared::domain::MediaKind;
use url::Url;

use crate::{
    realtime::ReconnectPolicy,
    upload::{BucketDescriptor, RetryPolicy},
};

pub const SETTINGS_FILE: &str = "forum_client.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub realtime_url: Option<String>,
    pub upload_retries: u32,
    pub upload_retry_delay_ms: u64,
    pub max_upload_bytes: u64,
    pub media_buckets: Vec<String>,
    pub voice_buckets: Vec<String>,
    pub max_recording_seconds: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub notification_feed_limit: usize,
    pub notify_follows: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".into(),
            api_key: String::new(),
            access_token: None,
            realtime_url: None,
            upload_retries: 3,
            upload_retry_delay_ms: 1_000,
            max_upload_bytes: 50 * 1024 * 1024,
            media_buckets: vec!["chat-media".into(), "public-media".into()],
            voice_buckets: vec!["voice-messages".into(), "chat-media".into()],
            max_recording_seconds: 300,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 10,
            notification_feed_limit: 100,
            notify_follows: false,
        }
    }
}

impl Settings {
    /// Websocket endpoint, derived from `backend_url` unless set explicitly.
    pub fn realtime_url(&self) -> Result<String> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let base = self.backend_url.trim_end_matches('/');
        if base.starts_with("https://") {
            Ok(base.replacen("https://", "wss://", 1))
        } else if base.starts_with("http://") {
            Ok(base.replacen("http://", "ws://", 1))
        } else {
            Err(anyhow!("backend_url must start with http:// or https://"))
        }
    }

    pub fn validate(&self) -> Result<()> {
        let parsed = Url::parse(&self.backend_url)
            .with_context(|| format!("invalid backend_url: {}", self.backend_url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("backend_url must use http or https"));
        }
        if let Some(realtime_url) = &self.realtime_url {
            let parsed = Url::parse(realtime_url)
                .with_context(|| format!("invalid realtime_url: {realtime_url}"))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(anyhow!("realtime_url must use ws or wss"));
            }
        }
        if self.upload_retries == 0 {
            return Err(anyhow!("upload_retries must be at least 1"));
        }
        if self.reconnect_max_attempts == 0 {
            return Err(anyhow!("reconnect_max_attempts must be at least 1"));
        }
        if self.media_buckets.is_empty() || self.voice_buckets.is_empty() {
            return Err(anyhow!("media_buckets and voice_buckets must not be empty"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts_per_candidate: self.upload_retries.max(1),
            delay: Duration::from_millis(self.upload_retry_delay_ms),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts.max(1),
        }
    }

    pub fn max_recording_duration(&self) -> Duration {
        Duration::from_secs(self.max_recording_seconds.max(1))
    }

    pub fn bucket_candidates(&self, kind: MediaKind) -> Vec<BucketDescriptor> {
        let names = match kind {
            MediaKind::Voice => &self.voice_buckets,
            _ => &self.media_buckets,
        };
        names.iter().map(BucketDescriptor::new).collect()
    }

    /// Applies a flat `key = value` table. Unknown keys are ignored.
    pub fn apply_file(&mut self, raw: &str) -> Result<()> {
        let table: toml::Table = toml::from_str(raw).context("invalid settings file")?;
        let values: HashMap<String, String> = table
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s,
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    toml::Value::Array(items) => items
                        .into_iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                        .join(","),
                    _ => return None,
                };
                Some((key, value))
            })
            .collect();
        for (key, value) in &values {
            self.apply_value(key, value)?;
        }
        Ok(())
    }

    /// Applies `FORUM_<KEY>` then `APP__<KEY>` overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for key in KEYS {
            let upper = key.to_ascii_uppercase();
            if let Some(v) = lookup(&format!("FORUM_{upper}")) {
                self.apply_value(key, &v)?;
            }
            if let Some(v) = lookup(&format!("APP__{upper}")) {
                self.apply_value(key, &v)?;
            }
        }
        Ok(())
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "backend_url" => self.backend_url = value.to_string(),
            "api_key" => self.api_key = value.to_string(),
            "access_token" => self.access_token = non_empty(value),
            "realtime_url" => self.realtime_url = non_empty(value),
            "upload_retries" => self.upload_retries = parse(key, value)?,
            "upload_retry_delay_ms" => self.upload_retry_delay_ms = parse(key, value)?,
            "max_upload_bytes" => self.max_upload_bytes = parse(key, value)?,
            "media_buckets" => self.media_buckets = split_list(value),
            "voice_buckets" => self.voice_buckets = split_list(value),
            "max_recording_seconds" => self.max_recording_seconds = parse(key, value)?,
            "reconnect_initial_delay_ms" => self.reconnect_initial_delay_ms = parse(key, value)?,
            "reconnect_max_delay_ms" => self.reconnect_max_delay_ms = parse(key, value)?,
            "reconnect_max_attempts" => self.reconnect_max_attempts = parse(key, value)?,
            "notification_feed_limit" => self.notification_feed_limit = parse(key, value)?,
            "notify_follows" => self.notify_follows = parse(key, value)?,
            _ => {}
        }
        Ok(())
    }
}

const KEYS: &[&str] = &[
    "backend_url",
    "api_key",
    "access_token",
    "realtime_url",
    "upload_retries",
    "upload_retry_delay_ms",
    "max_upload_bytes",
    "media_buckets",
    "voice_buckets",
    "max_recording_seconds",
    "reconnect_initial_delay_ms",
    "reconnect_max_delay_ms",
    "reconnect_max_attempts",
    "notification_feed_limit",
    "notify_follows",
];

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| anyhow!("invalid value for {key}: {value:?} ({err})"))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        settings
            .apply_file(&raw)
            .with_context(|| format!("failed to apply {}", path.display()))?;
    }
    settings.apply_env(|name| std::env::var(name).ok())?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
