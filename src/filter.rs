// RFC 4515 search filter strings and their RFC 4511 BER form.
//
// Substring and extensible-match filters are recognized but rejected
// up front with a typed error, so callers fail before any bytes go
// out on the wire.

use crate::error::{LdapError, Result};
use crate::protocol::{BerReader, BerWriter};

const FILTER_TAG_AND: u8 = 0xA0;
const FILTER_TAG_OR: u8 = 0xA1;
const FILTER_TAG_NOT: u8 = 0xA2;
const FILTER_TAG_EQUALITY: u8 = 0xA3;
const FILTER_TAG_SUBSTRINGS: u8 = 0xA4;
const FILTER_TAG_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_TAG_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_TAG_PRESENT: u8 = 0x87;
const FILTER_TAG_APPROX: u8 = 0xA8;
const FILTER_TAG_EXTENSIBLE: u8 = 0xA9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: Vec<u8> },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Approx { attribute: String, value: Vec<u8> },
    Present(String),
}

impl Filter {
    /// Parse an RFC 4515 filter string. Hex escapes (`\2a` etc.) in
    /// assertion values are decoded to raw bytes.
    pub fn parse(input: &str) -> Result<Filter> {
        let mut parser = FilterParser::new(input);
        let filter = parser.parse_filter()?;
        if parser.pos != parser.input.len() {
            return Err(LdapError::InvalidFilter(format!(
                "trailing characters at offset {}: {:?}",
                parser.pos, input
            )));
        }
        Ok(filter)
    }

    pub(crate) fn write_ber(&self, writer: &mut BerWriter) -> Result<()> {
        match self {
            Filter::And(parts) => self.write_set(writer, FILTER_TAG_AND, parts),
            Filter::Or(parts) => self.write_set(writer, FILTER_TAG_OR, parts),
            Filter::Not(inner) => {
                writer.write_tag(FILTER_TAG_NOT);
                let len_pos = writer.write_length_placeholder();
                inner.write_ber(writer)?;
                writer.patch_length(len_pos);
                Ok(())
            }
            Filter::Equality { attribute, value } => {
                write_ava(writer, FILTER_TAG_EQUALITY, attribute, value);
                Ok(())
            }
            Filter::GreaterOrEqual { attribute, value } => {
                write_ava(writer, FILTER_TAG_GREATER_OR_EQUAL, attribute, value);
                Ok(())
            }
            Filter::LessOrEqual { attribute, value } => {
                write_ava(writer, FILTER_TAG_LESS_OR_EQUAL, attribute, value);
                Ok(())
            }
            Filter::Approx { attribute, value } => {
                write_ava(writer, FILTER_TAG_APPROX, attribute, value);
                Ok(())
            }
            Filter::Present(attribute) => {
                // present [7] IMPLICIT AttributeDescription (primitive)
                writer.write_context_string(FILTER_TAG_PRESENT, attribute.as_bytes());
                Ok(())
            }
        }
    }

    fn write_set(&self, writer: &mut BerWriter, tag: u8, parts: &[Filter]) -> Result<()> {
        writer.write_tag(tag);
        let len_pos = writer.write_length_placeholder();
        for part in parts {
            part.write_ber(writer)?;
        }
        writer.patch_length(len_pos);
        Ok(())
    }

    pub(crate) fn read_ber(reader: &mut BerReader) -> Result<Filter> {
        let tag = reader.read_tag()?;
        match tag {
            FILTER_TAG_AND | FILTER_TAG_OR => {
                let end = reader.read_content_end()?;
                let mut parts = Vec::new();
                while reader.position() < end {
                    parts.push(Filter::read_ber(reader)?);
                }
                if tag == FILTER_TAG_AND {
                    Ok(Filter::And(parts))
                } else {
                    Ok(Filter::Or(parts))
                }
            }
            FILTER_TAG_NOT => {
                let _end = reader.read_content_end()?;
                Ok(Filter::Not(Box::new(Filter::read_ber(reader)?)))
            }
            FILTER_TAG_EQUALITY | FILTER_TAG_GREATER_OR_EQUAL | FILTER_TAG_LESS_OR_EQUAL
            | FILTER_TAG_APPROX => {
                let _end = reader.read_content_end()?;
                let attribute = reader.read_string()?;
                let value = reader.read_octet_string()?;
                Ok(match tag {
                    FILTER_TAG_EQUALITY => Filter::Equality { attribute, value },
                    FILTER_TAG_GREATER_OR_EQUAL => Filter::GreaterOrEqual { attribute, value },
                    FILTER_TAG_LESS_OR_EQUAL => Filter::LessOrEqual { attribute, value },
                    _ => Filter::Approx { attribute, value },
                })
            }
            FILTER_TAG_PRESENT => {
                let attribute = reader.read_string_value()?;
                Ok(Filter::Present(attribute))
            }
            FILTER_TAG_SUBSTRINGS => Err(LdapError::UnsupportedFilter(
                "substring filters are not supported".to_string(),
            )),
            FILTER_TAG_EXTENSIBLE => Err(LdapError::UnsupportedFilter(
                "extensible-match filters are not supported".to_string(),
            )),
            other => Err(LdapError::Malformed(format!(
                "unknown filter tag 0x{:02X}",
                other
            ))),
        }
    }
}

/// AttributeValueAssertion: context-tagged SEQUENCE of attribute
/// description and assertion value.
fn write_ava(writer: &mut BerWriter, tag: u8, attribute: &str, value: &[u8]) {
    writer.write_tag(tag);
    let len_pos = writer.write_length_placeholder();
    writer.write_string(attribute);
    writer.write_octet_string(value);
    writer.patch_length(len_pos);
}

struct FilterParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> FilterParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(LdapError::InvalidFilter(format!(
                "expected {:?} at offset {}",
                byte as char, self.pos
            ))),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => {
                return Err(LdapError::InvalidFilter(
                    "unterminated filter".to_string(),
                ))
            }
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut parts = Vec::new();
        while self.peek() == Some(b'(') {
            parts.push(self.parse_filter()?);
        }
        if parts.is_empty() {
            return Err(LdapError::InvalidFilter(
                "empty filter set".to_string(),
            ));
        }
        Ok(parts)
    }

    fn parse_item(&mut self) -> Result<Filter> {
        let attr_start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'>' | b'<' | b'~' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let attribute = std::str::from_utf8(&self.input[attr_start..self.pos])
            .map_err(|_| LdapError::InvalidFilter("non-UTF-8 attribute".to_string()))?
            .to_string();
        if attribute.is_empty() {
            return Err(LdapError::InvalidFilter(format!(
                "missing attribute at offset {}",
                attr_start
            )));
        }
        if attribute.contains(':') {
            return Err(LdapError::UnsupportedFilter(
                "extensible-match filters are not supported".to_string(),
            ));
        }

        let op = self.peek().ok_or_else(|| {
            LdapError::InvalidFilter("filter item missing operator".to_string())
        })?;
        match op {
            b'=' => {
                self.pos += 1;
                let (value, wildcards) = self.parse_value()?;
                if wildcards == 1 && value.is_empty() {
                    Ok(Filter::Present(attribute))
                } else if wildcards > 0 {
                    Err(LdapError::UnsupportedFilter(
                        "substring filters are not supported".to_string(),
                    ))
                } else {
                    Ok(Filter::Equality { attribute, value })
                }
            }
            b'>' => {
                self.pos += 1;
                self.expect(b'=')?;
                let (value, wildcards) = self.parse_value()?;
                if wildcards > 0 {
                    return Err(LdapError::InvalidFilter(
                        "wildcard in ordering filter".to_string(),
                    ));
                }
                Ok(Filter::GreaterOrEqual { attribute, value })
            }
            b'<' => {
                self.pos += 1;
                self.expect(b'=')?;
                let (value, wildcards) = self.parse_value()?;
                if wildcards > 0 {
                    return Err(LdapError::InvalidFilter(
                        "wildcard in ordering filter".to_string(),
                    ));
                }
                Ok(Filter::LessOrEqual { attribute, value })
            }
            b'~' => {
                self.pos += 1;
                self.expect(b'=')?;
                let (value, wildcards) = self.parse_value()?;
                if wildcards > 0 {
                    return Err(LdapError::InvalidFilter(
                        "wildcard in approx filter".to_string(),
                    ));
                }
                Ok(Filter::Approx { attribute, value })
            }
            other => Err(LdapError::InvalidFilter(format!(
                "unexpected {:?} at offset {}",
                other as char, self.pos
            ))),
        }
    }

    /// Value up to the closing paren. Returns the de-escaped bytes and
    /// the count of unescaped `*` wildcards seen.
    fn parse_value(&mut self) -> Result<(Vec<u8>, usize)> {
        let mut value = Vec::new();
        let mut wildcards = 0usize;
        loop {
            match self.peek() {
                Some(b')') | None => break,
                Some(b'(') => {
                    return Err(LdapError::InvalidFilter(format!(
                        "unescaped '(' in value at offset {}",
                        self.pos
                    )))
                }
                Some(b'*') => {
                    wildcards += 1;
                    self.pos += 1;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let hi = self.hex_digit()?;
                    let lo = self.hex_digit()?;
                    value.push((hi << 4) | lo);
                }
                Some(b) => {
                    value.push(b);
                    self.pos += 1;
                }
            }
        }
        Ok((value, wildcards))
    }

    fn hex_digit(&mut self) -> Result<u8> {
        let b = self.peek().ok_or_else(|| {
            LdapError::InvalidFilter("truncated hex escape".to_string())
        })?;
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => {
                return Err(LdapError::InvalidFilter(format!(
                    "invalid hex digit {:?} at offset {}",
                    b as char, self.pos
                )))
            }
        };
        self.pos += 1;
        Ok(digit)
    }
}
