//! Runtime configuration.
//!
//! The binary fills these from command-line flags and the environment; the
//! defaults mirror the production deployment (line 3, topic `subway`).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::publish::DeliveryPolicy;

pub const DEFAULT_BASE_URL: &str = "http://swopenapi.seoul.go.kr/api/subway";

/// Where and what to fetch.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub api_key: String,
    /// Line name (`3호선`) or subway id (`1003`).
    pub line: String,
    pub page_start: u32,
    /// Inclusive end of the page window; the feed caps it at its own maximum.
    pub page_end: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            line: "3호선".to_string(),
            page_start: 0,
            page_end: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub topic: String,
    pub policy: DeliveryPolicy,
    pub flush_timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            topic: "subway".to_string(),
            policy: DeliveryPolicy::BestEffort,
            flush_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 0 = fire-and-forget, 1 = wait for the broker's acknowledgement.
    pub qos: u8,
    pub keep_alive: Duration,
    /// A whole batch travels as one message, so this must fit the largest
    /// expected batch.
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "subway-relay".to_string(),
            username: None,
            password: None,
            qos: 1,
            keep_alive: Duration::from_secs(30),
            max_packet_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub feed: FeedConfig,
    pub handoff_dir: PathBuf,
    /// Number of newest artifacts kept after each write.
    pub handoff_retain: usize,
    pub publish: PublishConfig,
    pub mqtt: MqttConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            handoff_dir: PathBuf::from("handoff"),
            handoff_retain: 1,
            publish: PublishConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Rejects settings that would only fail later, mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.feed.api_key.trim().is_empty() {
            return Err(PipelineError::Config("feed API key is empty".into()));
        }
        if self.feed.line.trim().is_empty() {
            return Err(PipelineError::Config("line filter is empty".into()));
        }
        if self.feed.page_start > self.feed.page_end {
            return Err(PipelineError::Config(format!(
                "page window {}..{} is inverted",
                self.feed.page_start, self.feed.page_end
            )));
        }
        if self.handoff_retain == 0 {
            return Err(PipelineError::Config(
                "handoff retention must keep at least the current artifact".into(),
            ));
        }
        if self.publish.topic.trim().is_empty() {
            return Err(PipelineError::Config("publish topic is empty".into()));
        }
        if self.mqtt.qos > 1 {
            return Err(PipelineError::Config(format!(
                "unsupported MQTT QoS {}",
                self.mqtt.qos
            )));
        }
        Ok(())
    }
}
