//! MSRP framing (RFC 4975)
//!
//! A buffered, line-based decoder for the chunk stream of one MSRP
//! connection plus encoders for the requests and responses this layer
//! sends. The decoder accepts input in arbitrary pieces and yields complete
//! frames as they become available. Bodies larger than the configured limit
//! are never buffered: the decoder reports the oversized request from its
//! headers alone and discards the body up to its end-line.

use bytes::{Buf, Bytes, BytesMut};
use nom::{
    bytes::complete::{tag, take_while1, take_while_m_n},
    character::complete::{not_line_ending, space0, space1},
    combinator::opt,
    sequence::preceded,
    IResult,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;

use crate::errors::{CallError, Result};

/// Upper bound on the start line plus headers of one frame
pub const MAX_HEADER_SECTION: usize = 16 * 1024;

const END_LINE_DASHES: &str = "-------";

/// Continuation flag at the end of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// `$`: last chunk of the message
    Complete,
    /// `+`: more chunks follow
    More,
    /// `#`: sender abandoned the message
    Aborted,
}

impl Continuation {
    pub fn as_char(&self) -> char {
        match self {
            Continuation::Complete => '$',
            Continuation::More => '+',
            Continuation::Aborted => '#',
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'$' => Ok(Continuation::Complete),
            b'+' => Ok(Continuation::More),
            b'#' => Ok(Continuation::Aborted),
            other => Err(CallError::msrp(format!(
                "Invalid continuation flag: {:?}",
                char::from(other)
            ))),
        }
    }
}

/// `Byte-Range: start-end/total` where end and total may be `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64, total: u64) -> Self {
        Self {
            start,
            end: Some(end),
            total: Some(total),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let err = || CallError::msrp(format!("Malformed Byte-Range: {}", value));
        let (range, total) = value.trim().split_once('/').ok_or_else(err)?;
        let (start, end) = range.split_once('-').ok_or_else(err)?;
        let star_or = |s: &str| -> Result<Option<u64>> {
            match s.trim() {
                "*" => Ok(None),
                n => n.parse().map(Some).map_err(|_| err()),
            }
        };
        let start: u64 = start.trim().parse().map_err(|_| err())?;
        if start == 0 {
            return Err(err());
        }
        Ok(Self {
            start,
            end: star_or(end)?,
            total: star_or(total)?,
        })
    }

    /// Length of the chunk as declared by the range, when known
    pub fn declared_len(&self) -> Option<u64> {
        self.end
            .filter(|end| *end >= self.start)
            .map(|end| end - self.start + 1)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |v: Option<u64>| v.map_or_else(|| "*".to_string(), |n| n.to_string());
        write!(f, "{}-{}/{}", self.start, part(self.end), part(self.total))
    }
}

/// An MSRP request (SEND or REPORT)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsrpRequest {
    pub transaction_id: String,
    pub method: String,
    pub to_path: String,
    pub from_path: String,
    pub message_id: Option<String>,
    pub byte_range: Option<ByteRange>,
    pub content_type: Option<String>,
    /// Headers not modelled above, in order
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub continuation: Continuation,
}

impl MsrpRequest {
    /// A bodiless SEND with a fresh transaction id
    pub fn send(to_path: impl Into<String>, from_path: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            transaction_id: new_transaction_id(),
            method: "SEND".to_string(),
            to_path: to_path.into(),
            from_path: from_path.into(),
            message_id: Some(message_id.into()),
            byte_range: None,
            content_type: None,
            headers: Vec::new(),
            body: Bytes::new(),
            continuation: Continuation::Complete,
        }
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: Bytes, range: ByteRange) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body;
        self.byte_range = Some(range);
        self
    }

    pub fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.body.len() + 256);
        out.extend_from_slice(format!("MSRP {} {}\r\n", self.transaction_id, self.method).as_bytes());
        out.extend_from_slice(format!("To-Path: {}\r\n", self.to_path).as_bytes());
        out.extend_from_slice(format!("From-Path: {}\r\n", self.from_path).as_bytes());
        if let Some(id) = &self.message_id {
            out.extend_from_slice(format!("Message-ID: {}\r\n", id).as_bytes());
        }
        if let Some(range) = &self.byte_range {
            out.extend_from_slice(format!("Byte-Range: {}\r\n", range).as_bytes());
        }
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if let Some(content_type) = &self.content_type {
            out.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
            out.extend_from_slice(&self.body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(
            format!(
                "{}{}{}\r\n",
                END_LINE_DASHES,
                self.transaction_id,
                self.continuation.as_char()
            )
            .as_bytes(),
        );
        out.freeze()
    }
}

/// An MSRP transaction response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsrpResponse {
    pub transaction_id: String,
    pub status: u16,
    pub comment: Option<String>,
    pub to_path: String,
    pub from_path: String,
}

impl MsrpResponse {
    /// Response to `request`, addressed back along its From-Path
    pub fn for_request(request: &MsrpRequest, status: u16) -> Self {
        Self {
            transaction_id: request.transaction_id.clone(),
            status,
            comment: Some(status_comment(status).to_string()).filter(|c| !c.is_empty()),
            to_path: first_uri(&request.from_path).to_string(),
            from_path: first_uri(&request.to_path).to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn encode(&self) -> Bytes {
        let mut start = format!("MSRP {} {:03}", self.transaction_id, self.status);
        if let Some(comment) = &self.comment {
            start.push(' ');
            start.push_str(comment);
        }
        Bytes::from(format!(
            "{}\r\nTo-Path: {}\r\nFrom-Path: {}\r\n{}{}$\r\n",
            start, self.to_path, self.from_path, END_LINE_DASHES, self.transaction_id
        ))
    }
}

fn status_comment(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        413 => "Message Too Large",
        415 => "Unsupported Media Type",
        481 => "No Such Session",
        501 => "Not Implemented",
        _ => "",
    }
}

fn first_uri(path: &str) -> &str {
    path.split_whitespace().next().unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsrpFrame {
    Request(MsrpRequest),
    Response(MsrpResponse),
}

/// Output of [`MsrpDecoder::decode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(MsrpFrame),
    /// A request whose body exceeds the limit. Only its headers are kept;
    /// the body is being discarded.
    Oversized(MsrpRequest),
}

enum StartLine<'a> {
    Request { tid: &'a str, method: &'a str },
    Response { tid: &'a str, status: u16, comment: Option<&'a str> },
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '%' | '=')
}

fn start_line(input: &str) -> IResult<&str, StartLine<'_>> {
    let (input, _) = tag("MSRP")(input)?;
    let (input, _) = space1(input)?;
    let (input, tid) = take_while1(is_ident_char)(input)?;
    let (input, _) = space1(input)?;

    if let Ok((rest, code)) = take_while_m_n::<_, _, nom::error::Error<&str>>(3, 3, |c: char| c.is_ascii_digit())(input) {
        if rest.is_empty() || rest.starts_with(' ') {
            let (rest, comment) = opt(preceded(space0, not_line_ending))(rest)?;
            let status = code.parse().unwrap_or(0);
            let comment = comment.map(str::trim).filter(|c| !c.is_empty());
            return Ok((rest, StartLine::Response { tid, status, comment }));
        }
    }

    let (input, method) = take_while1(|c: char| c.is_ascii_uppercase())(input)?;
    Ok((input, StartLine::Request { tid, method }))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Incremental decoder for one MSRP connection
#[derive(Debug)]
pub struct MsrpDecoder {
    buffer: BytesMut,
    max_body: usize,
    /// Transaction whose oversized body is being discarded
    skipping: Option<String>,
}

impl MsrpDecoder {
    pub fn new(max_body: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_body,
            skipping: None,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes held waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard everything buffered, e.g. after a framing error
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.skipping = None;
    }

    /// Next complete frame, or `None` when more input is needed
    pub fn decode(&mut self) -> Result<Option<Decoded>> {
        if let Some(tid) = self.skipping.clone() {
            if !self.skip_body(&tid) {
                return Ok(None);
            }
            self.skipping = None;
        }

        // Tolerate stray CRLFs between frames
        while self.buffer.starts_with(b"\r\n") {
            self.buffer.advance(2);
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let Some(line_end) = find(&self.buffer, b"\r\n") else {
            return self.incomplete_headers();
        };
        let line = std::str::from_utf8(&self.buffer[..line_end])
            .map_err(|_| CallError::msrp("Start line is not UTF-8"))?;
        let (_, start) = start_line(line)
            .map_err(|_| CallError::msrp(format!("Malformed start line: {:.60}", line)))?;
        let (tid, start) = match start {
            StartLine::Request { tid, method } => (tid.to_string(), (Some(method.to_string()), 0, None)),
            StartLine::Response { tid, status, comment } => {
                (tid.to_string(), (None, status, comment.map(str::to_string)))
            }
        };
        let end_prefix = format!("{}{}", END_LINE_DASHES, tid);

        let mut pos = line_end + 2;
        let mut headers: Vec<(String, String)> = Vec::new();
        let body_start;
        let mut bodiless_flag = None;
        loop {
            let Some(rel) = find(&self.buffer[pos..], b"\r\n") else {
                return self.incomplete_headers();
            };
            let line = &self.buffer[pos..pos + rel];
            if line.starts_with(end_prefix.as_bytes()) {
                let flag = line
                    .get(end_prefix.len())
                    .ok_or_else(|| CallError::msrp("End-line without continuation flag"))?;
                bodiless_flag = Some(Continuation::from_byte(*flag)?);
                body_start = pos + rel + 2;
                break;
            }
            if line.is_empty() {
                body_start = pos + 2;
                break;
            }
            let text = std::str::from_utf8(line).map_err(|_| CallError::msrp("Header is not UTF-8"))?;
            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| CallError::msrp(format!("Malformed header: {:.60}", text)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
            pos += rel + 2;
        }

        let (method, status, comment) = start;
        let Some(method) = method else {
            // Responses never carry a body
            if bodiless_flag.is_none() {
                return Err(CallError::msrp("Response carries a body"));
            }
            let response = MsrpResponse {
                transaction_id: tid,
                status,
                comment,
                to_path: take_header(&mut headers, "To-Path").unwrap_or_default(),
                from_path: take_header(&mut headers, "From-Path").unwrap_or_default(),
            };
            self.buffer.advance(body_start);
            return Ok(Some(Decoded::Frame(MsrpFrame::Response(response))));
        };

        let mut request = build_request(tid.clone(), method, headers)?;

        if let Some(flag) = bodiless_flag {
            request.continuation = flag;
            self.buffer.advance(body_start);
            return Ok(Some(Decoded::Frame(MsrpFrame::Request(request))));
        }

        let declared_too_large = request
            .byte_range
            .and_then(|r| r.declared_len())
            .map_or(false, |len| len > self.max_body as u64);
        if declared_too_large {
            return Ok(Some(self.start_skipping(request, body_start)));
        }

        let needle = format!("\r\n{}", end_prefix);
        let Some(end) = find(&self.buffer[body_start..], needle.as_bytes()) else {
            if self.buffer.len() - body_start > self.max_body + needle.len() + 3 {
                return Ok(Some(self.start_skipping(request, body_start)));
            }
            return Ok(None);
        };
        if end > self.max_body {
            return Ok(Some(self.start_skipping(request, body_start)));
        }

        let flag_at = body_start + end + needle.len();
        if self.buffer.len() < flag_at + 3 {
            return Ok(None);
        }
        request.continuation = Continuation::from_byte(self.buffer[flag_at])?;

        self.buffer.advance(body_start);
        request.body = self.buffer.split_to(end).freeze();
        self.buffer.advance(needle.len() + 3);
        Ok(Some(Decoded::Frame(MsrpFrame::Request(request))))
    }

    fn incomplete_headers(&self) -> Result<Option<Decoded>> {
        if self.buffer.len() > MAX_HEADER_SECTION + self.max_body {
            return Err(CallError::msrp("Header section too large"));
        }
        Ok(None)
    }

    fn start_skipping(&mut self, mut request: MsrpRequest, body_start: usize) -> Decoded {
        request.continuation = Continuation::More;
        // Keep the CRLF that precedes the end-line searchable
        self.buffer.advance(body_start.saturating_sub(2));
        self.skipping = Some(request.transaction_id.clone());
        Decoded::Oversized(request)
    }

    /// Drop body bytes up to and including the end-line of `tid`.
    /// Returns true once the end-line was consumed.
    fn skip_body(&mut self, tid: &str) -> bool {
        let needle = format!("\r\n{}{}", END_LINE_DASHES, tid);
        match find(&self.buffer, needle.as_bytes()) {
            Some(at) if self.buffer.len() >= at + needle.len() + 3 => {
                self.buffer.advance(at + needle.len() + 3);
                true
            }
            Some(_) => false,
            None => {
                let keep = needle.len() + 2;
                if self.buffer.len() > keep {
                    let drop = self.buffer.len() - keep;
                    self.buffer.advance(drop);
                }
                false
            }
        }
    }
}

fn take_header(headers: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let idx = headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))?;
    Some(headers.remove(idx).1)
}

fn build_request(tid: String, method: String, mut headers: Vec<(String, String)>) -> Result<MsrpRequest> {
    let to_path = take_header(&mut headers, "To-Path")
        .ok_or_else(|| CallError::msrp("Request without To-Path"))?;
    let from_path = take_header(&mut headers, "From-Path")
        .ok_or_else(|| CallError::msrp("Request without From-Path"))?;
    let byte_range = take_header(&mut headers, "Byte-Range")
        .map(|v| ByteRange::parse(&v))
        .transpose()?;
    Ok(MsrpRequest {
        transaction_id: tid,
        method,
        to_path,
        from_path,
        message_id: take_header(&mut headers, "Message-ID"),
        byte_range,
        content_type: take_header(&mut headers, "Content-Type"),
        headers,
        body: Bytes::new(),
        continuation: Continuation::Complete,
    })
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn new_transaction_id() -> String {
    random_token(12)
}

pub fn new_message_id() -> String {
    random_token(16)
}
