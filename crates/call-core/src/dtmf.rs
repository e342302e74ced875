//! DTMF tone dispatch
//!
//! Tones go out either as RFC 4733 telephone events on the negotiated audio
//! stream or, when the peer did not negotiate `telephone-event`, as SIP INFO
//! requests carrying an `application/dtmf-relay` body. Start and stop
//! requests are serialized per peer so that a peer never has two tones
//! playing at once.

use dashmap::DashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{DtmfConfig, DtmfMethodPreference};
use crate::errors::{CallError, Result};
use crate::media::MediaEngine;
use crate::peer::CallPeer;
use crate::signaling::{Body, SignalingTransport, SipMethod, CONTENT_TYPE_DTMF_RELAY};
use crate::types::{PeerId, ProviderId};

/// DTMF tone definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfTone {
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfTone {
    pub fn to_char(self) -> char {
        match self {
            Self::Digit0 => '0',
            Self::Digit1 => '1',
            Self::Digit2 => '2',
            Self::Digit3 => '3',
            Self::Digit4 => '4',
            Self::Digit5 => '5',
            Self::Digit6 => '6',
            Self::Digit7 => '7',
            Self::Digit8 => '8',
            Self::Digit9 => '9',
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Digit0),
            '1' => Some(Self::Digit1),
            '2' => Some(Self::Digit2),
            '3' => Some(Self::Digit3),
            '4' => Some(Self::Digit4),
            '5' => Some(Self::Digit5),
            '6' => Some(Self::Digit6),
            '7' => Some(Self::Digit7),
            '8' => Some(Self::Digit8),
            '9' => Some(Self::Digit9),
            '*' => Some(Self::Star),
            '#' => Some(Self::Pound),
            'A' | 'a' => Some(Self::A),
            'B' | 'b' => Some(Self::B),
            'C' | 'c' => Some(Self::C),
            'D' | 'd' => Some(Self::D),
            _ => None,
        }
    }

    /// RFC 4733 event code
    pub fn event_code(self) -> u8 {
        match self {
            Self::Star => 10,
            Self::Pound => 11,
            Self::A => 12,
            Self::B => 13,
            Self::C => 14,
            Self::D => 15,
            digit => digit.to_char() as u8 - b'0',
        }
    }

    pub fn from_event_code(code: u8) -> Option<Self> {
        match code {
            0..=9 => Self::from_char(char::from(b'0' + code)),
            10 => Some(Self::Star),
            11 => Some(Self::Pound),
            12 => Some(Self::A),
            13 => Some(Self::B),
            14 => Some(Self::C),
            15 => Some(Self::D),
            _ => None,
        }
    }
}

impl fmt::Display for DtmfTone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

impl FromStr for DtmfTone {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CallError::invalid_argument("DTMF tone is unset"));
        }
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => DtmfTone::from_char(c)
                .ok_or_else(|| CallError::invalid_argument(format!("Invalid DTMF tone: {}", s))),
            _ => Err(CallError::invalid_argument(format!("Invalid DTMF tone: {}", s))),
        }
    }
}

/// Tone delivery mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfMethod {
    /// RFC 4733 events on the negotiated payload type
    Rfc4733 { payload_type: u8 },
    /// SIP INFO with an `application/dtmf-relay` body
    SipInfo,
}

/// Parse an `application/dtmf-relay` body into a tone and optional duration
pub fn parse_dtmf_relay(body: &str) -> Result<(DtmfTone, Option<u64>)> {
    let mut tone = None;
    let mut duration = None;
    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "signal" => {
                tone = match value.parse::<u8>() {
                    Ok(code) if code >= 10 => DtmfTone::from_event_code(code),
                    _ => value.parse::<DtmfTone>().ok(),
                };
            }
            "duration" => duration = value.parse::<u64>().ok(),
            _ => {}
        }
    }
    let tone = tone.ok_or_else(|| CallError::invalid_argument("dtmf-relay body has no valid Signal"))?;
    Ok((tone, duration))
}

/// Render an `application/dtmf-relay` body
pub fn format_dtmf_relay(tone: DtmfTone, duration: Duration) -> String {
    format!("Signal={}\r\nDuration={}\r\n", tone, duration.as_millis())
}

#[derive(Debug, Clone, Copy)]
struct ActiveTone {
    tone: DtmfTone,
    method: DtmfMethod,
    started: Instant,
}

/// Per-provider DTMF dispatcher
pub struct DtmfDispatcher {
    provider_id: ProviderId,
    config: DtmfConfig,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaEngine>,
    active: DashMap<PeerId, Arc<Mutex<Option<ActiveTone>>>>,
}

impl DtmfDispatcher {
    pub fn new(
        provider_id: ProviderId,
        config: DtmfConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaEngine>,
    ) -> Self {
        Self {
            provider_id,
            config,
            transport,
            media,
            active: DashMap::new(),
        }
    }

    /// Mechanism used for `peer` given what its audio stream negotiated
    pub fn method_for(&self, peer: &CallPeer) -> DtmfMethod {
        let negotiated = peer
            .negotiated_streams()
            .and_then(|s| s.telephone_event);
        match (self.config.method, negotiated) {
            (DtmfMethodPreference::SipInfo, _) => DtmfMethod::SipInfo,
            (_, Some(payload_type)) => DtmfMethod::Rfc4733 { payload_type },
            (DtmfMethodPreference::Rfc4733, None) => {
                debug!(peer = %peer.id(), "telephone-event not negotiated, falling back to SIP INFO");
                DtmfMethod::SipInfo
            }
            (DtmfMethodPreference::Auto, None) => DtmfMethod::SipInfo,
        }
    }

    /// Start playing `tone` to `peer`, stopping any tone still active on it.
    ///
    /// The peer is a reference, so an unset peer cannot be expressed; an
    /// empty or unknown tone is an invalid argument.
    pub async fn start_tone(&self, peer: &CallPeer, tone: &str) -> Result<()> {
        self.check_peer(peer)?;
        let tone: DtmfTone = tone.parse()?;
        if !peer.state().is_established() {
            return Err(CallError::invalid_state(format!(
                "Cannot send DTMF to peer in state {}",
                peer.state()
            )));
        }

        let slot = self.slot(peer.id());
        let mut current = slot.lock().await;
        if let Some(previous) = current.take() {
            trace!(peer = %peer.id(), tone = %previous.tone, "Stopping previous tone");
            self.finish(peer, previous).await?;
        }

        let method = self.method_for(peer);
        if let DtmfMethod::Rfc4733 { payload_type } = method {
            self.media
                .start_telephone_event(peer.id(), tone, payload_type)
                .await?;
        }
        debug!(peer = %peer.id(), %tone, ?method, "DTMF tone started");
        *current = Some(ActiveTone {
            tone,
            method,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Stop the active tone of `peer`; a no-op when none is playing
    pub async fn stop_tone(&self, peer: &CallPeer) -> Result<()> {
        self.check_peer(peer)?;
        let slot = self.slot(peer.id());
        let mut current = slot.lock().await;
        match current.take() {
            Some(active) => self.finish(peer, active).await,
            None => Ok(()),
        }
    }

    /// Tone currently playing for a peer
    pub async fn active_tone(&self, peer: &PeerId) -> Option<DtmfTone> {
        let slot = self.active.get(peer).map(|s| s.value().clone())?;
        let current = slot.lock().await;
        current.as_ref().map(|a| a.tone)
    }

    /// Drop per-peer state once the peer has ended
    pub(crate) fn forget(&self, peer: &PeerId) {
        self.active.remove(peer);
    }

    fn check_peer(&self, peer: &CallPeer) -> Result<()> {
        if peer.provider_id() != self.provider_id {
            return Err(CallError::unsupported_peer(format!(
                "Peer {} belongs to provider {}",
                peer.id(),
                peer.provider_id()
            )));
        }
        Ok(())
    }

    fn slot(&self, peer: &PeerId) -> Arc<Mutex<Option<ActiveTone>>> {
        self.active
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    async fn finish(&self, peer: &CallPeer, active: ActiveTone) -> Result<()> {
        match active.method {
            DtmfMethod::Rfc4733 { .. } => self.media.stop_telephone_event(peer.id()).await,
            DtmfMethod::SipInfo => {
                let min = Duration::from_millis(self.config.min_tone_duration_ms);
                let duration = active.started.elapsed().max(min);
                let body = Body::new(CONTENT_TYPE_DTMF_RELAY, format_dtmf_relay(active.tone, duration));
                debug!(peer = %peer.id(), tone = %active.tone, ms = duration.as_millis() as u64, "Sending DTMF INFO");
                self.transport
                    .send_request(peer.dialog(), SipMethod::Info, Some(body), None)
                    .await
            }
        }
    }
}
