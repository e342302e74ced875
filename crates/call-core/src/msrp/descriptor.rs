//! File transfer descriptors (RFC 5547)
//!
//! A file offer travels in the message m-line as two attributes:
//!
//! ```text
//! a=file-selector:name:"report.pdf" type:application/pdf size:32349 hash:sha-1:72:24:5F:...
//! a=file-transfer-id:vBnG916bdberum2fFEABR1FR3ExZMUrd
//! ```

use nom::{
    bytes::complete::{take_till1, take_until, take_while1},
    character::complete::{char, multispace0, multispace1},
    branch::alt,
    multi::separated_list0,
    sequence::{delimited, preceded, separated_pair},
    IResult,
};

use crate::errors::{CallError, Result};

pub const FILE_SELECTOR: &str = "file-selector";
pub const FILE_TRANSFER_ID: &str = "file-transfer-id";

/// Description of a file offered over MSRP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub name: String,
    pub content_type: Option<String>,
    pub size: u64,
    /// `<algorithm>:<hex>` as carried in the selector
    pub hash: Option<String>,
    /// Value of the file-transfer-id attribute
    pub transfer_id: String,
}

impl TransferDescriptor {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            size,
            hash: None,
            transfer_id: super::frame::new_message_id(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Build a descriptor from the two SDP attribute values.
    ///
    /// name, size and the transfer id are mandatory; a missing or
    /// unparsable one is a malformed offer.
    pub fn from_attributes(file_selector: Option<&str>, file_transfer_id: Option<&str>) -> Result<Self> {
        let selector = file_selector
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CallError::malformed_offer("missing file-selector attribute"))?;
        let transfer_id = file_transfer_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CallError::malformed_offer("missing file-transfer-id attribute"))?;

        let (rest, params) = selector_params(selector)
            .map_err(|_| CallError::malformed_offer(format!("unparsable file-selector: {}", selector)))?;
        if !rest.trim().is_empty() {
            return Err(CallError::malformed_offer(format!(
                "trailing data in file-selector: {}",
                rest
            )));
        }

        let mut name = None;
        let mut content_type = None;
        let mut size = None;
        let mut hash = None;
        for (key, value) in params {
            match key.to_ascii_lowercase().as_str() {
                "name" => name = Some(value.to_string()),
                "type" => content_type = Some(value.to_string()),
                "size" => {
                    let parsed = value
                        .parse::<u64>()
                        .map_err(|_| CallError::malformed_offer(format!("invalid size: {}", value)))?;
                    size = Some(parsed);
                }
                "hash" => hash = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            name: name
                .filter(|n| !n.is_empty())
                .ok_or_else(|| CallError::malformed_offer("file-selector has no name"))?,
            content_type,
            size: size.ok_or_else(|| CallError::malformed_offer("file-selector has no size"))?,
            hash,
            transfer_id: transfer_id.to_string(),
        })
    }

    pub fn file_selector(&self) -> String {
        let mut selector = format!("name:\"{}\"", self.name.replace('"', "%22"));
        if let Some(content_type) = &self.content_type {
            selector.push_str(&format!(" type:{}", content_type));
        }
        selector.push_str(&format!(" size:{}", self.size));
        if let Some(hash) = &self.hash {
            selector.push_str(&format!(" hash:{}", hash));
        }
        selector
    }

    /// SDP attributes announcing this file
    pub fn to_attributes(&self) -> Vec<(String, Option<String>)> {
        vec![
            (FILE_SELECTOR.to_string(), Some(self.file_selector())),
            (FILE_TRANSFER_ID.to_string(), Some(self.transfer_id.clone())),
        ]
    }
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_until("\""), char('"'))(input)
}

fn selector_param(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
        char(':'),
        alt((quoted, take_till1(|c: char| c.is_whitespace()))),
    )(input)
}

fn selector_params(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    preceded(multispace0, separated_list0(multispace1, selector_param))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_selector() {
        let d = TransferDescriptor::from_attributes(
            Some("name:\"My cool picture.jpg\" type:image/jpeg size:32349 hash:sha-1:72:24:5F:E8"),
            Some("vBnG916bdberum2fFEABR1FR3ExZMUrd"),
        )
        .unwrap();
        assert_eq!(d.name, "My cool picture.jpg");
        assert_eq!(d.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(d.size, 32349);
        assert_eq!(d.hash.as_deref(), Some("sha-1:72:24:5F:E8"));
        assert_eq!(d.transfer_id, "vBnG916bdberum2fFEABR1FR3ExZMUrd");
    }

    #[test]
    fn test_missing_size_is_malformed() {
        let err = TransferDescriptor::from_attributes(Some("name:\"a.txt\" type:text/plain"), Some("id1"))
            .unwrap_err();
        assert!(matches!(err, CallError::MalformedOffer { .. }));
        assert!(err.to_string().contains("size"));
    }

    #[test]
    fn test_missing_identifier_or_name_is_malformed() {
        assert!(TransferDescriptor::from_attributes(Some("name:\"a\" size:1"), None).is_err());
        assert!(TransferDescriptor::from_attributes(Some("size:1"), Some("id")).is_err());
        assert!(TransferDescriptor::from_attributes(Some("name:\"a\" size:big"), Some("id")).is_err());
        assert!(TransferDescriptor::from_attributes(None, Some("id")).is_err());
    }

    #[test]
    fn test_selector_attributes_parse_back() {
        let d = TransferDescriptor::new("notes.txt", 120)
            .with_content_type("text/plain")
            .with_hash("sha-1:AA:BB");
        let attrs = d.to_attributes();
        let parsed = TransferDescriptor::from_attributes(attrs[0].1.as_deref(), attrs[1].1.as_deref()).unwrap();
        assert_eq!(parsed, d);
    }
}
