//! Call-core configuration
//!
//! Configuration is resolved once into typed structures when a provider is
//! built. Every section has sensible defaults, can be adjusted with the
//! builder-style `with_*` methods, or loaded from YAML.
//!
//! ```rust
//! use rvoip_call_core::config::CallCoreConfig;
//!
//! let config = CallCoreConfig::from_yaml_str(
//!     "media:\n  capabilities:\n    video: true\nmsrp:\n  chunk_size: 4096\n",
//! ).unwrap();
//! assert!(config.media.capabilities.video);
//! assert_eq!(config.msrp.chunk_size, 4096);
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::errors::{CallError, Result};
use crate::media::MediaCapabilities;

/// Top-level configuration for a call provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallCoreConfig {
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
    pub dtmf: DtmfConfig,
    pub msrp: MsrpConfig,
}

impl CallCoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML document; missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CallCoreConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_capabilities(mut self, capabilities: MediaCapabilities) -> Self {
        self.media.capabilities = capabilities;
        self
    }

    pub fn with_local_address(mut self, address: IpAddr) -> Self {
        self.media.local_address = address;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.msrp.max_message_size = size;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.msrp.chunk_size = size;
        self
    }

    pub fn with_dtmf_method(mut self, method: DtmfMethodPreference) -> Self {
        self.dtmf.method = method;
        self
    }

    pub fn with_ringing_retransmissions(mut self, interval: Duration, max: u32) -> Self {
        self.signaling.ringing_retransmit_interval_ms = interval.as_millis() as u64;
        self.signaling.max_ringing_retransmissions = max;
        self
    }

    /// Reject configurations the rest of the crate cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.msrp.chunk_size == 0 {
            return Err(CallError::config("msrp.chunk_size must be greater than zero"));
        }
        if self.msrp.chunk_size > self.msrp.max_message_size {
            return Err(CallError::config(format!(
                "msrp.chunk_size ({}) exceeds msrp.max_message_size ({})",
                self.msrp.chunk_size, self.msrp.max_message_size
            )));
        }
        if self.media.capabilities.audio && self.media.audio_codecs.is_empty() {
            return Err(CallError::config("audio is enabled but no audio codec is configured"));
        }
        if let Some(pt) = self.media.telephone_event_payload {
            if !(96..=127).contains(&pt) {
                return Err(CallError::config(format!(
                    "telephone-event payload type {} is not dynamic (96-127)",
                    pt
                )));
            }
        }
        Ok(())
    }
}

/// One codec entry advertised in offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
}

impl CodecSpec {
    pub fn new(payload_type: u8, encoding: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            payload_type,
            encoding: encoding.into(),
            clock_rate,
        }
    }
}

/// Media negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Capabilities every new peer starts with
    pub capabilities: MediaCapabilities,
    /// Address advertised in the origin and connection lines
    pub local_address: IpAddr,
    pub session_name: String,
    pub username: String,
    pub audio_codecs: Vec<CodecSpec>,
    pub video_codecs: Vec<CodecSpec>,
    /// Dynamic payload type offered for RFC 4733 telephone events
    pub telephone_event_payload: Option<u8>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            capabilities: MediaCapabilities::default(),
            local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            session_name: "rvoip".to_string(),
            username: "-".to_string(),
            audio_codecs: vec![CodecSpec::new(0, "PCMU", 8000), CodecSpec::new(8, "PCMA", 8000)],
            video_codecs: vec![CodecSpec::new(96, "H264", 90000), CodecSpec::new(97, "VP8", 90000)],
            telephone_event_payload: Some(101),
        }
    }
}

/// Signalling behaviour owned by this layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// First retransmission delay of 180 Ringing on unreliable transports
    pub ringing_retransmit_interval_ms: u64,
    pub max_ringing_retransmissions: u32,
}

impl SignalingConfig {
    pub fn ringing_retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.ringing_retransmit_interval_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ringing_retransmit_interval_ms: 500,
            max_ringing_retransmissions: 3,
        }
    }
}

/// Which DTMF delivery mechanism to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtmfMethodPreference {
    /// RFC 4733 when telephone-event was negotiated, SIP INFO otherwise
    #[default]
    Auto,
    Rfc4733,
    SipInfo,
}

/// DTMF settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DtmfConfig {
    pub method: DtmfMethodPreference,
    /// Shortest duration reported in an INFO dtmf-relay body
    pub min_tone_duration_ms: u64,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self {
            method: DtmfMethodPreference::Auto,
            min_tone_duration_ms: 100,
        }
    }
}

/// MSRP sub-session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MsrpConfig {
    /// Inbound chunks or messages larger than this are refused before buffering
    pub max_message_size: usize,
    /// Body size of outgoing file chunks
    pub chunk_size: usize,
    pub accept_types: Vec<String>,
}

impl Default for MsrpConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            chunk_size: 2048,
            accept_types: vec!["text/plain".to_string(), "message/cpim".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = CallCoreConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.media.capabilities.audio);
        assert!(!config.media.capabilities.video);
        assert_eq!(config.signaling.max_ringing_retransmissions, 3);
        assert_eq!(config.signaling.ringing_retransmit_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
dtmf:
  method: sip_info
msrp:
  max_message_size: 8192
  chunk_size: 1024
"#;
        let config = CallCoreConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.dtmf.method, DtmfMethodPreference::SipInfo);
        assert_eq!(config.msrp.max_message_size, 8192);
        assert_eq!(config.media.telephone_event_payload, Some(101));
    }

    #[test]
    fn test_chunk_larger_than_max_is_rejected() {
        let config = CallCoreConfig::new().with_max_message_size(100).with_chunk_size(200);
        assert!(matches!(config.validate(), Err(CallError::Configuration { .. })));
    }

    #[test]
    fn test_static_telephone_event_payload_rejected() {
        let mut config = CallCoreConfig::new();
        config.media.telephone_event_payload = Some(8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_configuration_error() {
        let err = CallCoreConfig::from_yaml_str("msrp: [1, 2").unwrap_err();
        assert!(matches!(err, CallError::Configuration { .. }));
    }
}
