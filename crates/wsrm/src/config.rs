// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable messaging configuration.
//!
//! Loaded from TOML or assembled with [`ConfigBuilder`]. Durations are stored
//! as milliseconds so the file format stays flat:
//!
//! ```toml
//! base_retransmission_interval_ms = 3000
//! exponential_backoff = true
//! acknowledgement_interval_ms = 200
//! delivery_assurance = "exactly-once"
//! in_order = true
//! protocol = "rm11-wsa200508"
//!
//! [source_policy.termination]
//! max_length = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default base retransmission interval (ms).
pub const DEFAULT_BASE_RETRANSMISSION_INTERVAL_MS: u64 = 3000;
/// Default exponent cap for exponential backoff.
pub const DEFAULT_BACKOFF_CAP: u32 = 6;
/// Default messages-per-minute threshold below which acks are sent immediately.
pub const DEFAULT_INTRA_MESSAGE_THRESHOLD: u32 = 10;
/// Default delay before an undispatched immediate ack is sent out of band (ms).
pub const DEFAULT_IMMEDIATE_ACKS_TIMEOUT_MS: u64 = 1000;
/// Default base redelivery interval (ms).
pub const DEFAULT_BASE_REDELIVERY_INTERVAL_MS: u64 = 3000;
/// Upper bound for every interval, timeout and expiration setting (ms).
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryAssurance {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl DeliveryAssurance {
    /// Whether receiving the same message twice must be suppressed.
    pub fn rejects_duplicates(self) -> bool {
        matches!(self, Self::AtMostOnce | Self::ExactlyOnce)
    }

    /// Whether a late message may be skipped instead of delivered in order.
    pub fn can_skip(self) -> bool {
        self == Self::AtMostOnce
    }
}

/// WS-RM / WS-Addressing namespace combination in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVariation {
    #[serde(rename = "rm10-wsa200408")]
    Rm10Wsa200408,
    #[default]
    #[serde(rename = "rm10-wsa200508")]
    Rm10Wsa200508,
    #[serde(rename = "rm11-wsa200508")]
    Rm11Wsa200508,
}

pub const RM10_NAMESPACE: &str = "http://schemas.xmlsoap.org/ws/2005/02/rm";
pub const RM11_NAMESPACE: &str = "http://docs.oasis-open.org/ws-rx/wsrm/200702";
pub const WSA200408_NAMESPACE: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub const WSA200508_NAMESPACE: &str = "http://www.w3.org/2005/08/addressing";

impl ProtocolVariation {
    pub fn rm_namespace(self) -> &'static str {
        match self {
            Self::Rm10Wsa200408 | Self::Rm10Wsa200508 => RM10_NAMESPACE,
            Self::Rm11Wsa200508 => RM11_NAMESPACE,
        }
    }

    pub fn addressing_namespace(self) -> &'static str {
        match self {
            Self::Rm10Wsa200408 => WSA200408_NAMESPACE,
            Self::Rm10Wsa200508 | Self::Rm11Wsa200508 => WSA200508_NAMESPACE,
        }
    }

    /// RM 1.0 signals the final message with a `LastMessage` header; 1.1 closes
    /// the sequence instead.
    pub fn uses_last_message_header(self) -> bool {
        !matches!(self, Self::Rm11Wsa200508)
    }

    pub fn from_namespaces(rm: &str, addressing: &str) -> Option<Self> {
        match (rm, addressing) {
            (RM10_NAMESPACE, WSA200408_NAMESPACE) => Some(Self::Rm10Wsa200408),
            (RM10_NAMESPACE, WSA200508_NAMESPACE) => Some(Self::Rm10Wsa200508),
            (RM11_NAMESPACE, WSA200508_NAMESPACE) => Some(Self::Rm11Wsa200508),
            _ => None,
        }
    }
}

/// Thresholds that make a source sequence mark its last message.
///
/// Zero disables a threshold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceTerminationPolicy {
    pub max_length: u64,
    pub max_ranges: usize,
    pub max_unacknowledged: u64,
    pub terminate_on_shutdown: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePolicy {
    /// Requested lifetime of new sequences; `None` never expires.
    pub sequence_expiration_ms: Option<u64>,
    /// Offer a reciprocal sequence when creating one.
    pub include_offer: bool,
    pub offered_sequence_expiration_ms: Option<u64>,
    pub termination: SequenceTerminationPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcksPolicy {
    pub intra_message_threshold: u32,
    pub immediate_acks_timeout_ms: u64,
}

impl Default for AcksPolicy {
    fn default() -> Self {
        Self {
            intra_message_threshold: DEFAULT_INTRA_MESSAGE_THRESHOLD,
            immediate_acks_timeout_ms: DEFAULT_IMMEDIATE_ACKS_TIMEOUT_MS,
        }
    }
}

/// Redelivery schedule for inbound messages the application failed to take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub exponential_backoff: bool,
    /// `None` retries forever, `Some(0)` disables redelivery.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_BASE_REDELIVERY_INTERVAL_MS,
            exponential_backoff: true,
            max_retries: Some(0),
        }
    }
}

impl RetryPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries != Some(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationPolicy {
    pub acks: AcksPolicy,
    pub retry: RetryPolicy,
}

/// Effective configuration of one reliable endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmConfiguration {
    pub base_retransmission_interval_ms: u64,
    pub exponential_backoff: bool,
    pub backoff_cap: u32,
    /// `None` retransmits until acknowledged.
    pub max_retransmissions: Option<u32>,
    /// Zero sends acknowledgements immediately.
    pub acknowledgement_interval_ms: u64,
    /// Zero disables inactivity termination.
    pub inactivity_timeout_ms: u64,
    pub delivery_assurance: DeliveryAssurance,
    pub in_order: bool,
    /// `None` waits for predecessors indefinitely.
    pub in_order_wait_timeout_ms: Option<u64>,
    pub protocol: ProtocolVariation,
    pub source_policy: SourcePolicy,
    pub destination_policy: DestinationPolicy,
}

impl Default for RmConfiguration {
    fn default() -> Self {
        Self {
            base_retransmission_interval_ms: DEFAULT_BASE_RETRANSMISSION_INTERVAL_MS,
            exponential_backoff: false,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            max_retransmissions: None,
            acknowledgement_interval_ms: 0,
            inactivity_timeout_ms: 0,
            delivery_assurance: DeliveryAssurance::default(),
            in_order: false,
            in_order_wait_timeout_ms: None,
            protocol: ProtocolVariation::default(),
            source_policy: SourcePolicy::default(),
            destination_policy: DestinationPolicy::default(),
        }
    }
}

impl RmConfiguration {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_retransmission_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "base_retransmission_interval_ms must be positive".into(),
            ));
        }
        if self.exponential_backoff && self.backoff_cap > 32 {
            return Err(ConfigError::Invalid(format!(
                "backoff_cap {} is too large (max 32)",
                self.backoff_cap
            )));
        }
        if self.in_order && self.delivery_assurance == DeliveryAssurance::AtMostOnce {
            log::debug!("[config] in-order at-most-once skips late messages");
        }
        if self.destination_policy.retry.is_enabled()
            && self.destination_policy.retry.interval_ms == 0
        {
            return Err(ConfigError::Invalid(
                "destination_policy.retry.interval_ms must be positive when retries are enabled"
                    .into(),
            ));
        }
        let durations = [
            ("base_retransmission_interval_ms", Some(self.base_retransmission_interval_ms)),
            ("acknowledgement_interval_ms", Some(self.acknowledgement_interval_ms)),
            ("inactivity_timeout_ms", Some(self.inactivity_timeout_ms)),
            ("in_order_wait_timeout_ms", self.in_order_wait_timeout_ms),
            (
                "source_policy.sequence_expiration_ms",
                self.source_policy.sequence_expiration_ms,
            ),
            (
                "source_policy.offered_sequence_expiration_ms",
                self.source_policy.offered_sequence_expiration_ms,
            ),
            (
                "destination_policy.acks.immediate_acks_timeout_ms",
                Some(self.destination_policy.acks.immediate_acks_timeout_ms),
            ),
            (
                "destination_policy.retry.interval_ms",
                Some(self.destination_policy.retry.interval_ms),
            ),
        ];
        for (name, value) in durations {
            if let Some(ms) = value.filter(|&ms| ms > MAX_DURATION_MS) {
                return Err(ConfigError::Invalid(format!(
                    "{} = {} exceeds the maximum of {} ms",
                    name, ms, MAX_DURATION_MS
                )));
            }
        }
        Ok(())
    }

    pub fn base_retransmission_interval(&self) -> Duration {
        Duration::from_millis(self.base_retransmission_interval_ms)
    }

    pub fn acknowledgement_interval(&self) -> Duration {
        Duration::from_millis(self.acknowledgement_interval_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn in_order_wait_timeout(&self) -> Option<Duration> {
        self.in_order_wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn immediate_acks_timeout(&self) -> Duration {
        Duration::from_millis(self.destination_policy.acks.immediate_acks_timeout_ms)
    }

    pub fn sequence_expiration(&self) -> Option<Duration> {
        self.source_policy
            .sequence_expiration_ms
            .map(Duration::from_millis)
    }

    pub fn termination_policy(&self) -> &SequenceTerminationPolicy {
        &self.source_policy.termination
    }
}

/// Chained construction of an [`RmConfiguration`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: RmConfiguration,
}

impl ConfigBuilder {
    pub fn base_retransmission_interval(mut self, interval: Duration) -> Self {
        self.config.base_retransmission_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.config.exponential_backoff = enabled;
        self
    }

    pub fn max_retransmissions(mut self, max: u32) -> Self {
        self.config.max_retransmissions = Some(max);
        self
    }

    pub fn acknowledgement_interval(mut self, interval: Duration) -> Self {
        self.config.acknowledgement_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactivity_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn delivery_assurance(mut self, assurance: DeliveryAssurance) -> Self {
        self.config.delivery_assurance = assurance;
        self
    }

    pub fn in_order(mut self, in_order: bool) -> Self {
        self.config.in_order = in_order;
        self
    }

    pub fn in_order_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.in_order_wait_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn protocol(mut self, protocol: ProtocolVariation) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn termination_policy(mut self, policy: SequenceTerminationPolicy) -> Self {
        self.config.source_policy.termination = policy;
        self
    }

    pub fn sequence_expiration(mut self, expiration: Duration) -> Self {
        self.config.source_policy.sequence_expiration_ms = Some(expiration.as_millis() as u64);
        self
    }

    pub fn include_offer(mut self, include: bool) -> Self {
        self.config.source_policy.include_offer = include;
        self
    }

    pub fn acks_policy(mut self, acks: AcksPolicy) -> Self {
        self.config.destination_policy.acks = acks;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.destination_policy.retry = retry;
        self
    }

    pub fn build(self) -> Result<RmConfiguration, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RmConfiguration::default();
        assert_eq!(config.base_retransmission_interval(), Duration::from_secs(3));
        assert_eq!(config.delivery_assurance, DeliveryAssurance::AtLeastOnce);
        assert_eq!(config.destination_policy.acks.intra_message_threshold, 10);
        assert!(!config.destination_policy.retry.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = RmConfiguration::from_toml_str(
            r#"
            exponential_backoff = true
            acknowledgement_interval_ms = 200
            delivery_assurance = "exactly-once"
            in_order = true
            protocol = "rm11-wsa200508"

            [source_policy.termination]
            max_length = 1000

            [destination_policy.retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert!(config.exponential_backoff);
        assert_eq!(config.acknowledgement_interval(), Duration::from_millis(200));
        assert_eq!(config.delivery_assurance, DeliveryAssurance::ExactlyOnce);
        assert_eq!(config.protocol, ProtocolVariation::Rm11Wsa200508);
        assert_eq!(config.termination_policy().max_length, 1000);
        assert_eq!(config.destination_policy.retry.max_retries, Some(5));
        assert_eq!(config.destination_policy.retry.interval_ms, 3000);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wsrm.toml");
        std::fs::write(&path, "in_order = true\ninactivity_timeout_ms = 5000\n").unwrap();

        let config = RmConfiguration::from_file(&path).unwrap();
        assert!(config.in_order);
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(5));

        let missing = RmConfiguration::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let err = RmConfiguration::from_toml_str("base_retransmission_interval_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let err = RmConfiguration::from_toml_str(&format!(
            "base_retransmission_interval_ms = {}",
            u64::MAX
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("base_retransmission")));

        let mut config = RmConfiguration::default();
        config.destination_policy.retry.interval_ms = MAX_DURATION_MS + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.destination_policy.retry.interval_ms = MAX_DURATION_MS;
        config.in_order_wait_timeout_ms = Some(MAX_DURATION_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_assurance_rejected() {
        let err = RmConfiguration::from_toml_str(r#"delivery_assurance = "twice""#).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_builder() {
        let config = RmConfiguration::builder()
            .base_retransmission_interval(Duration::from_millis(50))
            .exponential_backoff(true)
            .in_order(true)
            .build()
            .unwrap();
        assert_eq!(config.base_retransmission_interval_ms, 50);
        assert!(config.in_order);
    }

    #[test]
    fn test_protocol_namespaces() {
        let p = ProtocolVariation::from_namespaces(RM11_NAMESPACE, WSA200508_NAMESPACE).unwrap();
        assert_eq!(p, ProtocolVariation::Rm11Wsa200508);
        assert!(!p.uses_last_message_header());
        assert_eq!(
            ProtocolVariation::Rm10Wsa200408.addressing_namespace(),
            WSA200408_NAMESPACE
        );
        assert!(ProtocolVariation::from_namespaces(RM11_NAMESPACE, WSA200408_NAMESPACE).is_none());
    }

    #[test]
    fn test_assurance_flags() {
        assert!(DeliveryAssurance::AtMostOnce.rejects_duplicates());
        assert!(DeliveryAssurance::ExactlyOnce.rejects_duplicates());
        assert!(!DeliveryAssurance::AtLeastOnce.rejects_duplicates());
        assert!(DeliveryAssurance::AtMostOnce.can_skip());
    }
}
