//! Session-description codec
//!
//! [`SdpCodec`] is the seam to whatever SDP implementation the embedding
//! stack uses. [`TextSdpCodec`] is a small line-oriented codec covering the
//! subset this layer negotiates: `v`, `o`, `s`, `c`, `t`, `m` and `a` lines.
//! Other line types are accepted and ignored.

use bytes::Bytes;
use nom::{
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{anychar, char, digit1, not_line_ending, space1},
    combinator::{map_res, opt, rest},
    sequence::{preceded, tuple},
    IResult,
};
use std::fmt::Write as _;
use std::net::IpAddr;

use crate::errors::{CallError, Result};
use crate::types::MediaType;

use super::description::{MediaDescription, MediaKind, Origin, RtpMap, SessionDescription};

/// Parse and serialize session descriptions
pub trait SdpCodec: Send + Sync {
    fn parse(&self, input: &[u8]) -> Result<SessionDescription>;
    fn serialize(&self, description: &SessionDescription) -> Bytes;
}

/// Plain-text SDP codec
#[derive(Debug, Clone, Copy, Default)]
pub struct TextSdpCodec;

impl SdpCodec for TextSdpCodec {
    fn parse(&self, input: &[u8]) -> Result<SessionDescription> {
        let text = std::str::from_utf8(input)
            .map_err(|e| CallError::sdp(format!("Description is not UTF-8: {}", e)))?;
        parse_session(text)
    }

    fn serialize(&self, description: &SessionDescription) -> Bytes {
        Bytes::from(serialize_session(description))
    }
}

/// Parse one `x=value` line, consuming its CRLF or LF terminator
pub fn parse_sdp_line(input: &str) -> IResult<&str, (char, &str)> {
    let (input, key) = anychar(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = not_line_ending(input)?;
    let input = input.trim_start_matches(['\r', '\n']);
    Ok((input, (key, value.trim())))
}

fn token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

fn number<T: std::str::FromStr>(input: &str) -> IResult<&str, T> {
    map_res(digit1, |s: &str| s.parse::<T>())(input)
}

/// `<media> <port>[/<count>] <proto> <fmt> ...`
fn media_line(input: &str) -> IResult<&str, (&str, u16, &str, &str)> {
    let (input, (media, _, port, _count, _, proto)) = tuple((
        take_while1(|c: char| c.is_ascii_alphanumeric()),
        space1,
        number::<u16>,
        opt(preceded(char('/'), digit1)),
        space1,
        token,
    ))(input)?;
    let (input, formats) = rest(input)?;
    Ok((input, (media, port, proto, formats.trim())))
}

/// `<pt> <encoding>/<rate>[/<channels>]`
fn rtpmap_value(input: &str) -> IResult<&str, RtpMap> {
    let (input, (pt, _, encoding, _, rate, channels)) = tuple((
        number::<u8>,
        space1,
        take_till1(|c: char| c == '/'),
        char('/'),
        number::<u32>,
        opt(preceded(char('/'), number::<u8>)),
    ))(input)?;
    Ok((
        input,
        RtpMap {
            payload_type: pt,
            encoding: encoding.to_string(),
            clock_rate: rate,
            channels,
        },
    ))
}

/// `IN IP4 <address>`
fn connection_value(input: &str) -> IResult<&str, IpAddr> {
    let (input, _) = tag("IN")(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = token(input)?;
    let (input, _) = space1(input)?;
    map_res(token, |s: &str| s.split('/').next().unwrap_or(s).parse::<IpAddr>())(input)
}

fn parse_origin(value: &str) -> Result<Origin> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 6 {
        return Err(CallError::sdp(format!("Malformed origin line: {}", value)));
    }
    let session_id = parts[1]
        .parse()
        .map_err(|_| CallError::sdp(format!("Invalid session id: {}", parts[1])))?;
    let session_version = parts[2]
        .parse()
        .map_err(|_| CallError::sdp(format!("Invalid session version: {}", parts[2])))?;
    let address = parts[5]
        .parse()
        .map_err(|_| CallError::sdp(format!("Invalid origin address: {}", parts[5])))?;
    Ok(Origin {
        username: parts[0].to_string(),
        session_id,
        session_version,
        address,
    })
}

fn parse_connection(value: &str) -> Result<IpAddr> {
    connection_value(value)
        .map(|(_, ip)| ip)
        .map_err(|_| CallError::sdp(format!("Malformed connection line: {}", value)))
}

fn apply_attribute(media: &mut MediaDescription, value: &str) -> Result<()> {
    let (name, attr_value) = match value.split_once(':') {
        Some((n, v)) => (n, Some(v.trim())),
        None => (value, None),
    };
    match (name, attr_value) {
        ("sendrecv" | "sendonly" | "recvonly" | "inactive", None) => {
            media.direction = name.parse()?;
        }
        ("rtpmap", Some(v)) => {
            let (_, map) = rtpmap_value(v)
                .map_err(|_| CallError::sdp(format!("Malformed rtpmap: {}", v)))?;
            media.rtpmaps.push(map);
        }
        ("content", Some("slides")) if media.media_type == MediaType::Video => {
            media.media_type = MediaKind::Known(MediaType::Desktop);
        }
        _ => media
            .attributes
            .push((name.to_string(), attr_value.map(str::to_string))),
    }
    Ok(())
}

fn parse_session(text: &str) -> Result<SessionDescription> {
    let mut origin = None;
    let mut session_name = String::new();
    let mut connection = None;
    let mut media: Vec<MediaDescription> = Vec::new();
    let mut saw_version = false;

    let mut input = text;
    while !input.trim().is_empty() {
        let (remaining, (key, value)) = parse_sdp_line(input)
            .map_err(|_| CallError::sdp(format!("Malformed line near: {:.40}", input)))?;
        input = remaining;

        match key {
            'v' => {
                if value != "0" {
                    return Err(CallError::sdp(format!("Unsupported SDP version: {}", value)));
                }
                saw_version = true;
            }
            'o' => origin = Some(parse_origin(value)?),
            's' => session_name = value.to_string(),
            'c' => {
                let ip = parse_connection(value)?;
                match media.last_mut() {
                    Some(m) => m.connection = Some(ip),
                    None => connection = Some(ip),
                }
            }
            'm' => {
                let (_, (kind, port, proto, formats)) = media_line(value)
                    .map_err(|_| CallError::sdp(format!("Malformed media line: {}", value)))?;
                let mut m = MediaDescription::new(MediaKind::from_token(kind), port, proto);
                m.formats = formats.split_whitespace().map(str::to_string).collect();
                media.push(m);
            }
            'a' => {
                if let Some(m) = media.last_mut() {
                    apply_attribute(m, value)?;
                }
            }
            _ => {}
        }
    }

    if !saw_version {
        return Err(CallError::sdp("Missing version line"));
    }
    let origin = origin.ok_or_else(|| CallError::sdp("Missing origin line"))?;

    Ok(SessionDescription {
        origin,
        session_name,
        connection,
        media,
    })
}

fn addr_type(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

fn serialize_session(sd: &SessionDescription) -> String {
    let mut out = String::new();
    let o = &sd.origin;
    // Writing to a String cannot fail
    let _ = write!(out, "v=0\r\n");
    let _ = write!(
        out,
        "o={} {} {} IN {} {}\r\n",
        o.username,
        o.session_id,
        o.session_version,
        addr_type(&o.address),
        o.address
    );
    let session_name = if sd.session_name.is_empty() { "-" } else { &sd.session_name };
    let _ = write!(out, "s={}\r\n", session_name);
    if let Some(ip) = &sd.connection {
        let _ = write!(out, "c=IN {} {}\r\n", addr_type(ip), ip);
    }
    let _ = write!(out, "t=0 0\r\n");

    for m in &sd.media {
        let _ = write!(
            out,
            "m={} {} {} {}\r\n",
            m.media_type.sdp_token(),
            m.port,
            m.protocol,
            m.formats.join(" ")
        );
        if let Some(ip) = &m.connection {
            let _ = write!(out, "c=IN {} {}\r\n", addr_type(ip), ip);
        }
        if m.is_rejected() {
            continue;
        }
        for map in &m.rtpmaps {
            let _ = match map.channels {
                Some(ch) => write!(out, "a=rtpmap:{} {}/{}/{}\r\n", map.payload_type, map.encoding, map.clock_rate, ch),
                None => write!(out, "a=rtpmap:{} {}/{}\r\n", map.payload_type, map.encoding, map.clock_rate),
            };
        }
        if m.media_type == MediaType::Desktop {
            let _ = write!(out, "a=content:slides\r\n");
        }
        for (name, value) in &m.attributes {
            let _ = match value {
                Some(v) => write!(out, "a={}:{}\r\n", name, v),
                None => write!(out, "a={}\r\n", name),
            };
        }
        let _ = write!(out, "a={}\r\n", m.direction.as_str());
    }
    out
}
