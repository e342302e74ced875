//! Structured session descriptions
//!
//! A [`SessionDescription`] is treated as an immutable value once built:
//! re-negotiation always produces a new one instead of patching the old.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::errors::{CallError, Result};
use crate::types::MediaType;

/// Transport profile for RTP media lines
pub const RTP_AVP: &str = "RTP/AVP";
/// Transport profile for MSRP message lines
pub const TCP_MSRP: &str = "TCP/MSRP";
/// Encoding name of RFC 4733 telephone events
pub const TELEPHONE_EVENT: &str = "telephone-event";

/// Media stream direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    /// The direction an answerer uses for an offered direction
    pub fn reverse(&self) -> Self {
        match self {
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            other => *other,
        }
    }

    /// Direction used by the side that puts the stream on hold
    pub fn held(&self) -> Self {
        match self {
            MediaDirection::SendRecv | MediaDirection::SendOnly => MediaDirection::SendOnly,
            MediaDirection::RecvOnly | MediaDirection::Inactive => MediaDirection::Inactive,
        }
    }

    /// sendonly or inactive, as advertised by the side holding the stream
    pub fn is_hold(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }
}

impl FromStr for MediaDirection {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sendrecv" => Ok(MediaDirection::SendRecv),
            "sendonly" => Ok(MediaDirection::SendOnly),
            "recvonly" => Ok(MediaDirection::RecvOnly),
            "inactive" => Ok(MediaDirection::Inactive),
            _ => Err(CallError::sdp(format!("Unknown direction attribute: {}", s))),
        }
    }
}

/// Media token of an m-line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Known(MediaType),
    /// A media type this layer does not negotiate (`application`, `text`, ...).
    /// Kept so the line can be declined in place.
    Other(String),
}

impl MediaKind {
    pub fn from_token(token: &str) -> Self {
        match token {
            "audio" => MediaKind::Known(MediaType::Audio),
            "video" => MediaKind::Known(MediaType::Video),
            "message" => MediaKind::Known(MediaType::Message),
            other => MediaKind::Other(other.to_string()),
        }
    }

    pub fn known(&self) -> Option<MediaType> {
        match self {
            MediaKind::Known(media_type) => Some(*media_type),
            MediaKind::Other(_) => None,
        }
    }

    pub fn sdp_token(&self) -> &str {
        match self {
            MediaKind::Known(media_type) => media_type.sdp_token(),
            MediaKind::Other(token) => token,
        }
    }
}

impl From<MediaType> for MediaKind {
    fn from(media_type: MediaType) -> Self {
        MediaKind::Known(media_type)
    }
}

impl PartialEq<MediaType> for MediaKind {
    fn eq(&self, other: &MediaType) -> bool {
        matches!(self, MediaKind::Known(m) if m == other)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Known(media_type) => write!(f, "{}", media_type),
            MediaKind::Other(token) => f.write_str(token),
        }
    }
}

/// `a=rtpmap` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

impl RtpMap {
    pub fn new(payload_type: u8, encoding: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            payload_type,
            encoding: encoding.into(),
            clock_rate,
            channels: None,
        }
    }

    /// Same codec regardless of payload type number
    pub fn same_codec(&self, other: &RtpMap) -> bool {
        self.encoding.eq_ignore_ascii_case(&other.encoding) && self.clock_rate == other.clock_rate
    }
}

/// `o=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub address: IpAddr,
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media_type: MediaKind,
    /// 0 marks a rejected or disabled stream
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<IpAddr>,
    pub rtpmaps: Vec<RtpMap>,
    pub direction: MediaDirection,
    /// Remaining attributes in order, excluding rtpmap, direction and
    /// the desktop content tag
    pub attributes: Vec<(String, Option<String>)>,
}

impl MediaDescription {
    pub fn new(media_type: impl Into<MediaKind>, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            port,
            protocol: protocol.into(),
            formats: Vec::new(),
            connection: None,
            rtpmaps: Vec::new(),
            direction: MediaDirection::SendRecv,
            attributes: Vec::new(),
        }
    }

    /// A port-0 copy of an offered stream, used to decline it in an answer
    pub fn rejected(offered: &MediaDescription) -> Self {
        Self {
            media_type: offered.media_type.clone(),
            port: 0,
            protocol: offered.protocol.clone(),
            formats: offered.formats.clone(),
            connection: None,
            rtpmaps: Vec::new(),
            direction: offered.direction,
            attributes: Vec::new(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.attributes.push((name.into(), value));
        self
    }

    /// First value of a named attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|(n, _)| n == name)
    }

    /// Codec for a format, from its rtpmap or the static payload table
    pub fn codec_for(&self, format: &str) -> Option<RtpMap> {
        let pt: u8 = format.parse().ok()?;
        self.rtpmaps
            .iter()
            .find(|m| m.payload_type == pt)
            .cloned()
            .or_else(|| static_payload(pt))
    }

    /// Payload type advertised for telephone events, if any
    pub fn telephone_event_payload(&self) -> Option<u8> {
        self.rtpmaps
            .iter()
            .find(|m| m.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT))
            .map(|m| m.payload_type)
    }
}

/// Well-known static RTP payload types (RFC 3551)
fn static_payload(pt: u8) -> Option<RtpMap> {
    let (encoding, rate) = match pt {
        0 => ("PCMU", 8000),
        3 => ("GSM", 8000),
        4 => ("G723", 8000),
        8 => ("PCMA", 8000),
        9 => ("G722", 8000),
        18 => ("G729", 8000),
        _ => return None,
    };
    Some(RtpMap::new(pt, encoding, rate))
}

/// A complete session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<IpAddr>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// First accepted (non-zero port) stream of a media type
    pub fn active_media(&self, media_type: MediaType) -> Option<&MediaDescription> {
        self.media
            .iter()
            .find(|m| m.media_type == media_type && !m.is_rejected())
    }

    pub fn has_active(&self, media_type: MediaType) -> bool {
        self.active_media(media_type).is_some()
    }

    /// Media types with an accepted stream, in m-line order
    pub fn active_media_types(&self) -> Vec<MediaType> {
        let mut types = Vec::new();
        for media_type in self
            .media
            .iter()
            .filter(|m| !m.is_rejected())
            .filter_map(|m| m.media_type.known())
        {
            if !types.contains(&media_type) {
                types.push(media_type);
            }
        }
        types
    }

    /// Direction of the audio stream; None when there is no active audio
    pub fn audio_direction(&self) -> Option<MediaDirection> {
        self.active_media(MediaType::Audio).map(|m| m.direction)
    }

    /// Transport address of a stream, using the session-level connection as fallback
    pub fn address_of(&self, media: &MediaDescription) -> Option<SocketAddr> {
        media
            .connection
            .or(self.connection)
            .map(|ip| SocketAddr::new(ip, media.port))
    }
}
