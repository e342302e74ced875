//! Media collaborator interface
//!
//! The media engine (codecs, RTP, ICE, capture) is outside this crate. The
//! core only reserves transport addresses through it, starts and stops the
//! negotiated streams, and drives RFC 4733 telephone events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::dtmf::DtmfTone;
use crate::errors::Result;
use crate::msrp::TransferDescriptor;
use crate::types::{MediaType, PeerId};

/// Locally enabled media for a peer. Changing any of these on an
/// established peer triggers a re-offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaCapabilities {
    pub audio: bool,
    pub video: bool,
    pub desktop: bool,
    pub messaging: bool,
    /// Offer our streams as sendonly
    #[serde(skip)]
    pub on_hold: bool,
    /// File offered on the message stream
    #[serde(skip)]
    pub file_transfer: Option<TransferDescriptor>,
}

impl Default for MediaCapabilities {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
            desktop: false,
            messaging: false,
            on_hold: false,
            file_transfer: None,
        }
    }
}

impl MediaCapabilities {
    /// Audio only
    pub fn audio_only() -> Self {
        Self::default()
    }

    /// MSRP messaging only
    pub fn messaging_only() -> Self {
        Self {
            audio: false,
            messaging: true,
            ..Self::default()
        }
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video = enabled;
        self
    }

    pub fn with_desktop(mut self, enabled: bool) -> Self {
        self.desktop = enabled;
        self
    }

    pub fn with_file_transfer(mut self, descriptor: TransferDescriptor) -> Self {
        self.messaging = true;
        self.file_transfer = Some(descriptor);
        self
    }

    pub fn is_enabled(&self, media_type: MediaType) -> bool {
        match media_type {
            MediaType::Audio => self.audio,
            MediaType::Video => self.video,
            MediaType::Desktop => self.desktop,
            MediaType::Message => self.messaging,
        }
    }

    /// Enabled media in m-line order
    pub fn enabled_media(&self) -> Vec<MediaType> {
        [MediaType::Audio, MediaType::Video, MediaType::Desktop, MediaType::Message]
            .into_iter()
            .filter(|m| self.is_enabled(*m))
            .collect()
    }
}

/// Result of an offer/answer exchange, as consumed by the media engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedStreams {
    pub audio: bool,
    pub video: bool,
    pub desktop: bool,
    pub message: bool,
    /// Payload type negotiated for RFC 4733 telephone events on audio
    pub telephone_event: Option<u8>,
    /// First common audio codec, encoding name
    pub audio_codec: Option<String>,
    /// Remote transport address of each negotiated stream
    pub remote_addresses: BTreeMap<MediaType, SocketAddr>,
}

impl NegotiatedStreams {
    pub fn contains(&self, media_type: MediaType) -> bool {
        match media_type {
            MediaType::Audio => self.audio,
            MediaType::Video => self.video,
            MediaType::Desktop => self.desktop,
            MediaType::Message => self.message,
        }
    }

    pub fn media_types(&self) -> Vec<MediaType> {
        [MediaType::Audio, MediaType::Video, MediaType::Desktop, MediaType::Message]
            .into_iter()
            .filter(|m| self.contains(*m))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.media_types().is_empty()
    }
}

/// Media/transport allocator and stream control
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Reserve a local transport address for one stream of `peer`
    async fn reserve(&self, peer: &PeerId, media_type: MediaType) -> Result<SocketAddr>;

    /// Release every address reserved for `peer`
    async fn release(&self, peer: &PeerId) -> Result<()>;

    /// Start (or update) media flow for the negotiated streams
    async fn start(&self, peer: &PeerId, streams: &NegotiatedStreams) -> Result<()>;

    async fn stop(&self, peer: &PeerId) -> Result<()>;

    /// Begin sending an RFC 4733 event on the audio stream
    async fn start_telephone_event(&self, peer: &PeerId, tone: DtmfTone, payload_type: u8) -> Result<()>;

    async fn stop_telephone_event(&self, peer: &PeerId) -> Result<()>;
}
