//! Session descriptions and offer/answer negotiation

pub mod codec;
pub mod description;
pub mod negotiator;

pub use codec::{SdpCodec, TextSdpCodec};
pub use description::{MediaDescription, MediaDirection, MediaKind, Origin, RtpMap, SessionDescription};
pub use negotiator::{detect_renegotiation_delta, DescriptionPair, Negotiator, RenegotiationDelta};
