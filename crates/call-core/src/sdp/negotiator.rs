//! Offer/answer negotiation
//!
//! The negotiator turns local [`MediaCapabilities`] into offers and answers,
//! intersects them with what the remote side accepts, and keeps the
//! transport addresses reserved for each peer stable across re-offers.
//!
//! Every operation works on a peer's [`DescriptionPair`]. Updates to the
//! pair are all-or-nothing: a failed negotiation leaves it untouched. The
//! pair lock is only taken for the final store, never across a call into
//! the media engine.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::{CallCoreConfig, CodecSpec, MediaConfig};
use crate::errors::{CallError, Result};
use crate::media::{MediaCapabilities, MediaEngine, NegotiatedStreams};
use crate::types::{MediaType, PeerId};

use super::codec::SdpCodec;
use super::description::{
    MediaDescription, MediaDirection, Origin, RtpMap, SessionDescription, RTP_AVP, TCP_MSRP,
    TELEPHONE_EVENT,
};

/// Local and remote session descriptions of one peer plus the streams
/// they agree on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptionPair {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub negotiated: Option<NegotiatedStreams>,
}

impl DescriptionPair {
    /// Hold is derived from the audio directions, never stored separately.
    pub fn is_on_hold(&self) -> bool {
        let held = |sd: &Option<SessionDescription>| {
            sd.as_ref()
                .and_then(|d| d.audio_direction())
                .map_or(false, |dir| dir.is_hold())
        };
        held(&self.local) || held(&self.remote)
    }
}

/// Stream-level differences between two descriptions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenegotiationDelta {
    pub hold_changed: bool,
    pub now_on_hold: bool,
    pub video_added: bool,
    pub video_removed: bool,
    pub desktop_changed: bool,
    pub streams_changed: bool,
}

impl RenegotiationDelta {
    pub fn is_empty(&self) -> bool {
        !(self.hold_changed
            || self.video_added
            || self.video_removed
            || self.desktop_changed
            || self.streams_changed)
    }
}

/// Compare the previous local description with a new remote one.
///
/// Only stream presence and audio direction are considered; two
/// descriptions that differ in origin version or codec order produce an
/// empty delta.
pub fn detect_renegotiation_delta(
    old_local: &SessionDescription,
    new_remote: &SessionDescription,
) -> RenegotiationDelta {
    let not_sendrecv = |sd: &SessionDescription| {
        sd.audio_direction()
            .map_or(false, |d| d != MediaDirection::SendRecv)
    };
    let old_hold = not_sendrecv(old_local);
    let new_hold = not_sendrecv(new_remote);

    let old_video = old_local.has_active(MediaType::Video);
    let new_video = new_remote.has_active(MediaType::Video);

    let mut old_types = old_local.active_media_types();
    let mut new_types = new_remote.active_media_types();
    old_types.sort();
    new_types.sort();

    RenegotiationDelta {
        hold_changed: old_hold != new_hold,
        now_on_hold: new_hold,
        video_added: !old_video && new_video,
        video_removed: old_video && !new_video,
        desktop_changed: old_local.has_active(MediaType::Desktop)
            != new_remote.has_active(MediaType::Desktop),
        streams_changed: old_types != new_types,
    }
}

/// Addresses and origin counters held for one peer
#[derive(Debug)]
struct PeerSlots {
    session_id: u64,
    version: u64,
    addresses: BTreeMap<MediaType, SocketAddr>,
}

impl PeerSlots {
    fn new() -> Self {
        Self {
            session_id: u64::from(rand::random::<u32>()),
            version: 0,
            addresses: BTreeMap::new(),
        }
    }
}

/// Session-description negotiator shared by all peers of a provider
pub struct Negotiator {
    config: MediaConfig,
    accept_types: Vec<String>,
    codec: Arc<dyn SdpCodec>,
    media: Arc<dyn MediaEngine>,
    slots: DashMap<PeerId, PeerSlots>,
}

impl Negotiator {
    pub fn new(config: &CallCoreConfig, codec: Arc<dyn SdpCodec>, media: Arc<dyn MediaEngine>) -> Self {
        Self {
            config: config.media.clone(),
            accept_types: config.msrp.accept_types.clone(),
            codec,
            media,
            slots: DashMap::new(),
        }
    }

    pub fn codec(&self) -> &Arc<dyn SdpCodec> {
        &self.codec
    }

    /// Build a fresh offer for the enabled media and store it as the
    /// peer's local description.
    pub async fn create_offer(
        &self,
        peer: &PeerId,
        pair: &Mutex<DescriptionPair>,
        caps: &MediaCapabilities,
    ) -> Result<Bytes> {
        let wanted = caps.enabled_media();
        if wanted.is_empty() {
            return Err(CallError::invalid_argument("No media enabled for offer"));
        }
        let addresses = self.addresses_for(peer, &wanted).await?;

        let mut media = Vec::with_capacity(wanted.len());
        for media_type in wanted {
            let addr = addresses[&media_type];
            let mut m = self.local_media(peer, media_type, addr, caps);
            m.direction = if media_type == MediaType::Message {
                if caps.file_transfer.is_some() {
                    MediaDirection::SendOnly
                } else {
                    MediaDirection::SendRecv
                }
            } else if caps.on_hold {
                MediaDirection::SendOnly
            } else {
                MediaDirection::SendRecv
            };
            media.push(m);
        }

        let offer = SessionDescription {
            origin: self.next_origin(peer),
            session_name: self.config.session_name.clone(),
            connection: Some(self.config.local_address),
            media,
        };
        let bytes = self.codec.serialize(&offer);
        debug!(peer = %peer, streams = offer.media.len(), "Created offer");
        pair.lock().local = Some(offer);
        Ok(bytes)
    }

    /// Apply the remote answer to our stored offer.
    ///
    /// Fails with a negotiation error when the answer is unusable or shares
    /// no media with the offer; the pair is left unchanged in that case.
    pub fn apply_answer(
        &self,
        peer: &PeerId,
        pair: &Mutex<DescriptionPair>,
        remote: &[u8],
    ) -> Result<NegotiatedStreams> {
        let answer = self
            .codec
            .parse(remote)
            .map_err(|e| CallError::negotiation(format!("Malformed remote description: {}", e)))?;

        let mut guard = pair.lock();
        let local = guard
            .local
            .as_ref()
            .ok_or_else(|| CallError::invalid_state("No local offer to apply an answer to"))?;
        let streams = intersect(local, &answer)?;

        debug!(peer = %peer, streams = ?streams.media_types(), "Applied answer");
        guard.remote = Some(answer);
        guard.negotiated = Some(streams.clone());
        Ok(streams)
    }

    /// Answer a remote offer with the subset of streams we support.
    ///
    /// Streams we cannot or do not want to take are declined with port 0.
    /// The answer and the offer are stored together on success only.
    pub async fn process_offer(
        &self,
        peer: &PeerId,
        pair: &Mutex<DescriptionPair>,
        offer: &[u8],
        caps: &MediaCapabilities,
    ) -> Result<(Bytes, NegotiatedStreams)> {
        let offer = self
            .codec
            .parse(offer)
            .map_err(|e| CallError::negotiation(format!("Malformed remote offer: {}", e)))?;

        // Decide per m-line first so no address is reserved for a doomed answer
        let mut accepted: Vec<MediaType> = Vec::new();
        let mut plan: Vec<bool> = Vec::with_capacity(offer.media.len());
        for rm in &offer.media {
            let usable = match rm.media_type.known() {
                Some(media_type) => {
                    !rm.is_rejected()
                        && caps.is_enabled(media_type)
                        && !accepted.contains(&media_type)
                        && self.supports(media_type, rm)
                }
                None => false,
            };
            if let (true, Some(media_type)) = (usable, rm.media_type.known()) {
                accepted.push(media_type);
            }
            plan.push(usable);
        }
        if accepted.is_empty() {
            return Err(CallError::negotiation("No common media in remote offer"));
        }

        let addresses = self.addresses_for(peer, &accepted).await?;

        let mut media = Vec::with_capacity(offer.media.len());
        for (rm, usable) in offer.media.iter().zip(plan) {
            let media_type = match (usable, rm.media_type.known()) {
                (true, Some(media_type)) => media_type,
                _ => {
                    trace!(peer = %peer, media = %rm.media_type, "Declining offered stream");
                    media.push(MediaDescription::rejected(rm));
                    continue;
                }
            };
            let addr = addresses[&media_type];
            media.push(self.answer_media(peer, media_type, rm, addr, caps));
        }

        let answer = SessionDescription {
            origin: self.next_origin(peer),
            session_name: self.config.session_name.clone(),
            connection: Some(self.config.local_address),
            media,
        };
        let streams = intersect(&answer, &offer)?;
        let bytes = self.codec.serialize(&answer);

        debug!(peer = %peer, streams = ?streams.media_types(), "Answered offer");
        let mut guard = pair.lock();
        guard.local = Some(answer);
        guard.remote = Some(offer);
        guard.negotiated = Some(streams.clone());
        Ok((bytes, streams))
    }

    /// Drop the cached addresses of a peer and release them in the engine
    pub async fn release(&self, peer: &PeerId) -> Result<()> {
        if self.slots.remove(peer).is_some() {
            debug!(peer = %peer, "Releasing media addresses");
            self.media.release(peer).await?;
        }
        Ok(())
    }

    /// Addresses currently held for a peer
    pub fn reserved_addresses(&self, peer: &PeerId) -> BTreeMap<MediaType, SocketAddr> {
        self.slots
            .get(peer)
            .map(|s| s.addresses.clone())
            .unwrap_or_default()
    }

    async fn addresses_for(
        &self,
        peer: &PeerId,
        wanted: &[MediaType],
    ) -> Result<BTreeMap<MediaType, SocketAddr>> {
        let missing: Vec<MediaType> = {
            let slots = self.slots.get(peer);
            wanted
                .iter()
                .copied()
                .filter(|m| slots.as_ref().map_or(true, |s| !s.addresses.contains_key(m)))
                .collect()
        };

        for media_type in missing {
            let addr = self.media.reserve(peer, media_type).await?;
            trace!(peer = %peer, media = %media_type, %addr, "Reserved address");
            self.slots
                .entry(*peer)
                .or_insert_with(PeerSlots::new)
                .addresses
                .entry(media_type)
                .or_insert(addr);
        }

        let slots = self
            .slots
            .get(peer)
            .ok_or_else(|| CallError::invalid_state("Media addresses released during negotiation"))?;
        wanted
            .iter()
            .map(|m| {
                slots
                    .addresses
                    .get(m)
                    .map(|a| (*m, *a))
                    .ok_or_else(|| CallError::invalid_state(format!("No address reserved for {}", m)))
            })
            .collect()
    }

    fn next_origin(&self, peer: &PeerId) -> Origin {
        let mut slots = self.slots.entry(*peer).or_insert_with(PeerSlots::new);
        slots.version += 1;
        Origin {
            username: self.config.username.clone(),
            session_id: slots.session_id,
            session_version: slots.version,
            address: self.config.local_address,
        }
    }

    fn codecs_for(&self, media_type: MediaType) -> &[CodecSpec] {
        match media_type {
            MediaType::Audio => &self.config.audio_codecs,
            MediaType::Video | MediaType::Desktop => &self.config.video_codecs,
            MediaType::Message => &[],
        }
    }

    fn connection_for(&self, addr: SocketAddr) -> Option<IpAddr> {
        (addr.ip() != self.config.local_address).then(|| addr.ip())
    }

    fn msrp_path(&self, peer: &PeerId, addr: SocketAddr) -> String {
        format!("msrp://{}/{};tcp", addr, peer.0.simple())
    }

    /// Our full description of one stream, used in offers
    fn local_media(
        &self,
        peer: &PeerId,
        media_type: MediaType,
        addr: SocketAddr,
        caps: &MediaCapabilities,
    ) -> MediaDescription {
        if media_type == MediaType::Message {
            let mut m = MediaDescription::new(MediaType::Message, addr.port(), TCP_MSRP);
            m.formats = vec!["*".to_string()];
            m.connection = self.connection_for(addr);
            let mut accept_types = self.accept_types.clone();
            if let Some(file) = &caps.file_transfer {
                let file_type = file.content_type.clone().unwrap_or_else(|| "*".to_string());
                if !accept_types.contains(&file_type) {
                    accept_types.push(file_type);
                }
            }
            m.attributes
                .push(("accept-types".to_string(), Some(accept_types.join(" "))));
            m.attributes
                .push(("path".to_string(), Some(self.msrp_path(peer, addr))));
            if let Some(file) = &caps.file_transfer {
                m.attributes.extend(file.to_attributes());
            }
            return m;
        }

        let mut m = MediaDescription::new(media_type, addr.port(), RTP_AVP);
        m.connection = self.connection_for(addr);
        for codec in self.codecs_for(media_type) {
            m.formats.push(codec.payload_type.to_string());
            m.rtpmaps
                .push(RtpMap::new(codec.payload_type, codec.encoding.clone(), codec.clock_rate));
        }
        if media_type == MediaType::Audio {
            if let Some(pt) = self.config.telephone_event_payload {
                m.formats.push(pt.to_string());
                m.rtpmaps.push(RtpMap::new(pt, TELEPHONE_EVENT, 8000));
                m.attributes
                    .push(("fmtp".to_string(), Some(format!("{} 0-15", pt))));
            }
        }
        m
    }

    /// Whether we share at least one codec with an offered stream
    fn supports(&self, media_type: MediaType, offered: &MediaDescription) -> bool {
        if media_type == MediaType::Message {
            return offered.protocol.eq_ignore_ascii_case(TCP_MSRP);
        }
        !self.common_formats(media_type, offered).is_empty()
    }

    /// Offered formats we can use, in the offerer's preference order
    fn common_formats(&self, media_type: MediaType, offered: &MediaDescription) -> Vec<RtpMap> {
        let ours = self.codecs_for(media_type);
        offered
            .formats
            .iter()
            .filter_map(|f| offered.codec_for(f))
            .filter(|c| !c.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT))
            .filter(|c| {
                ours.iter().any(|o| {
                    o.encoding.eq_ignore_ascii_case(&c.encoding) && o.clock_rate == c.clock_rate
                })
            })
            .collect()
    }

    fn answer_media(
        &self,
        peer: &PeerId,
        media_type: MediaType,
        offered: &MediaDescription,
        addr: SocketAddr,
        caps: &MediaCapabilities,
    ) -> MediaDescription {
        let mut direction = offered.direction.reverse();
        if caps.on_hold && media_type != MediaType::Message {
            direction = direction.held();
        }

        if media_type == MediaType::Message {
            let mut m = MediaDescription::new(MediaType::Message, addr.port(), TCP_MSRP);
            m.formats = vec!["*".to_string()];
            m.connection = self.connection_for(addr);
            m.direction = direction;
            let accept_types = offered
                .attribute("accept-types")
                .map(str::to_string)
                .unwrap_or_else(|| self.accept_types.join(" "));
            m.attributes
                .push(("accept-types".to_string(), Some(accept_types)));
            m.attributes
                .push(("path".to_string(), Some(self.msrp_path(peer, addr))));
            for name in ["file-selector", "file-transfer-id"] {
                if let Some(value) = offered.attribute(name) {
                    m.attributes.push((name.to_string(), Some(value.to_string())));
                }
            }
            return m;
        }

        let mut m = MediaDescription::new(media_type, addr.port(), offered.protocol.clone());
        m.connection = self.connection_for(addr);
        m.direction = direction;
        for codec in self.common_formats(media_type, offered) {
            m.formats.push(codec.payload_type.to_string());
            m.rtpmaps.push(codec);
        }
        if media_type == MediaType::Audio && self.config.telephone_event_payload.is_some() {
            if let Some(pt) = offered.telephone_event_payload() {
                m.formats.push(pt.to_string());
                m.rtpmaps.push(RtpMap::new(pt, TELEPHONE_EVENT, 8000));
                m.attributes
                    .push(("fmtp".to_string(), Some(format!("{} 0-15", pt))));
            }
        }
        m
    }
}

/// First codec of `remote` that `local` also lists
fn first_common_codec(local: &MediaDescription, remote: &MediaDescription) -> Option<RtpMap> {
    remote
        .formats
        .iter()
        .filter_map(|f| remote.codec_for(f))
        .filter(|c| !c.encoding.eq_ignore_ascii_case(TELEPHONE_EVENT))
        .find(|rc| {
            local
                .formats
                .iter()
                .filter_map(|f| local.codec_for(f))
                .any(|lc| lc.same_codec(rc))
        })
}

/// Streams active on both sides
fn intersect(local: &SessionDescription, remote: &SessionDescription) -> Result<NegotiatedStreams> {
    let mut streams = NegotiatedStreams::default();

    for media_type in local.active_media_types() {
        let (Some(lm), Some(rm)) = (local.active_media(media_type), remote.active_media(media_type))
        else {
            continue;
        };

        let codec = if media_type == MediaType::Message {
            None
        } else {
            match first_common_codec(lm, rm) {
                Some(codec) => Some(codec),
                None => continue,
            }
        };

        match media_type {
            MediaType::Audio => {
                streams.audio = true;
                streams.audio_codec = codec.map(|c| c.encoding);
                if lm.telephone_event_payload().is_some() {
                    streams.telephone_event = rm.telephone_event_payload();
                }
            }
            MediaType::Video => streams.video = true,
            MediaType::Desktop => streams.desktop = true,
            MediaType::Message => streams.message = true,
        }
        if let Some(addr) = remote.address_of(rm) {
            streams.remote_addresses.insert(media_type, addr);
        }
    }

    if streams.is_empty() {
        return Err(CallError::negotiation("No common media between offer and answer"));
    }
    Ok(streams)
}
