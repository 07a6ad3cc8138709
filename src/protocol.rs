// LDAP v3 protocol handling with BER encoding/decoding (RFC 4511),
// client side: requests are encoded, responses are decoded. Both
// directions round-trip so scripted test servers can reuse the codec.

use crate::error::{LdapError, Result};
use crate::filter::Filter;
use std::io::{Cursor, Read};

/// Paged Results control OID (RFC 2696 / AD).
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Notice of Disconnection OID (RFC 4511 §4.4.1). Unsolicited, message id 0.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// StartTLS extended operation OID (RFC 4511 §4.14).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// WhoAmI extended operation OID (RFC 4532).
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

// LDAP protocol tag constants ([APPLICATION n], constructed unless noted)
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
/// [APPLICATION 2] primitive NULL
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF Control trailing the protocolOp.
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

/// Top-level LDAPMessage is always a universal SEQUENCE.
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// RFC 4511 §4.1.9 result codes plus a catch-all for vendor (AD) codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    AliasDereferencingProblem,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    NamingViolation,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    Other,
    Vendor(u32),
}

impl ResultCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            5 => ResultCode::CompareFalse,
            6 => ResultCode::CompareTrue,
            7 => ResultCode::AuthMethodNotSupported,
            8 => ResultCode::StrongerAuthRequired,
            10 => ResultCode::Referral,
            11 => ResultCode::AdminLimitExceeded,
            12 => ResultCode::UnavailableCriticalExtension,
            13 => ResultCode::ConfidentialityRequired,
            14 => ResultCode::SaslBindInProgress,
            16 => ResultCode::NoSuchAttribute,
            17 => ResultCode::UndefinedAttributeType,
            18 => ResultCode::InappropriateMatching,
            19 => ResultCode::ConstraintViolation,
            20 => ResultCode::AttributeOrValueExists,
            21 => ResultCode::InvalidAttributeSyntax,
            32 => ResultCode::NoSuchObject,
            33 => ResultCode::AliasProblem,
            34 => ResultCode::InvalidDnSyntax,
            36 => ResultCode::AliasDereferencingProblem,
            48 => ResultCode::InappropriateAuthentication,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            54 => ResultCode::LoopDetect,
            64 => ResultCode::NamingViolation,
            65 => ResultCode::ObjectClassViolation,
            66 => ResultCode::NotAllowedOnNonLeaf,
            67 => ResultCode::NotAllowedOnRdn,
            68 => ResultCode::EntryAlreadyExists,
            69 => ResultCode::ObjectClassModsProhibited,
            71 => ResultCode::AffectsMultipleDsas,
            80 => ResultCode::Other,
            v => ResultCode::Vendor(v),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongerAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::SaslBindInProgress => 14,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::InappropriateMatching => 18,
            ResultCode::ConstraintViolation => 19,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::AliasProblem => 33,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::AliasDereferencingProblem => 36,
            ResultCode::InappropriateAuthentication => 48,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::LoopDetect => 54,
            ResultCode::NamingViolation => 64,
            ResultCode::ObjectClassViolation => 65,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::NotAllowedOnRdn => 67,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::ObjectClassModsProhibited => 69,
            ResultCode::AffectsMultipleDsas => 71,
            ResultCode::Other => 80,
            ResultCode::Vendor(v) => *v,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Vendor(v) => write!(f, "vendorCode({})", v),
            other => write!(f, "{:?}({})", other, other.as_u32()),
        }
    }
}

/// LDAP Control (request or response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub control_type: String,
    pub criticality: bool,
    pub value: Option<Vec<u8>>,
}

/// One attribute with opaque values. Value typing is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAttribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

/// Components common to all result-bearing responses (RFC 4511 §4.1.9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostics_message: String,
    pub referrals: Option<Vec<String>>,
}

impl LdapResult {
    pub fn success() -> Self {
        LdapResult {
            result_code: ResultCode::Success,
            matched_dn: String::new(),
            diagnostics_message: String::new(),
            referrals: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(SearchResultDone),
    SearchResultReference(Vec<String>),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    /// [7] serverSaslCreds, present during multi-step SASL binds.
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u32> for SearchScope {
    type Error = LdapError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(LdapError::Malformed(format!("invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

impl TryFrom<u32> for DerefAliases {
    type Error = LdapError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObject),
            3 => Ok(DerefAliases::Always),
            _ => Err(LdapError::Malformed(format!("invalid deref policy: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<PartialAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultDone {
    pub result: LdapResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    /// True for the unsolicited termination notice (message id 0).
    pub fn is_notice_of_disconnection(&self) -> bool {
        self.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID)
    }
}

// ---------------------------------------------------------------------------
// PDU completeness scan

/// Result of checking whether the buffer holds one complete PDU.
/// "Need more bytes" is a normal outcome here, never an error; only
/// impossible length encodings are malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduScan {
    Incomplete,
    Malformed(String),
    Complete { total_len: usize },
}

/// Inspect the leading bytes of a BER TLV and decide whether the whole
/// element is buffered. Handles short-form, long-form (up to 4 size
/// bytes, capped at i32::MAX) and indefinite lengths.
pub fn scan_pdu(buf: &[u8]) -> PduScan {
    if buf.len() < 2 {
        return PduScan::Incomplete;
    }
    let len_octet = buf[1];
    if len_octet == 0xFF {
        return PduScan::Malformed("reserved length octet 0xFF".to_string());
    }
    if len_octet & 0x80 == 0 {
        // Short form
        let total = 2 + len_octet as usize;
        return if buf.len() >= total {
            PduScan::Complete { total_len: total }
        } else {
            PduScan::Incomplete
        };
    }
    if len_octet == 0x80 {
        // Indefinite form: scan for the 00 00 end-of-contents marker.
        let mut i = 2;
        while i + 1 < buf.len() {
            if buf[i] == 0x00 && buf[i + 1] == 0x00 {
                return PduScan::Complete { total_len: i + 2 };
            }
            i += 1;
        }
        return PduScan::Incomplete;
    }
    // Long form
    let size_bytes = (len_octet & 0x7F) as usize;
    if size_bytes > 4 {
        return PduScan::Malformed(format!("length encoding of {} bytes", size_bytes));
    }
    if buf.len() < 2 + size_bytes {
        return PduScan::Incomplete;
    }
    let mut length: u64 = 0;
    for i in 0..size_bytes {
        length = (length << 8) | buf[2 + i] as u64;
    }
    if length > i32::MAX as u64 {
        return PduScan::Malformed(format!("declared length {} exceeds i32::MAX", length));
    }
    let total = 2 + size_bytes + length as usize;
    if buf.len() >= total {
        PduScan::Complete { total_len: total }
    } else {
        PduScan::Incomplete
    }
}

// ---------------------------------------------------------------------------
// BER parsing utilities

pub(crate) struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn malformed(msg: impl Into<String>) -> LdapError {
        LdapError::Malformed(msg.into())
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| Self::malformed("truncated: expected tag"))?;
        Ok(buf[0])
    }

    fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| Self::malformed("truncated: expected length"))?;
        let first = buf[0];
        if (first & 0x80) == 0 {
            return Ok(first as usize);
        }
        let size_bytes = (first & 0x7F) as usize;
        if size_bytes == 0 {
            return Err(Self::malformed("indefinite length inside a PDU"));
        }
        if size_bytes > 4 {
            return Err(Self::malformed(format!("length too large: {} bytes", size_bytes)));
        }
        let mut length: u64 = 0;
        for _ in 0..size_bytes {
            self.cursor
                .read_exact(&mut buf)
                .map_err(|_| Self::malformed("truncated length encoding"))?;
            length = (length << 8) | buf[0] as u64;
        }
        if length > i32::MAX as u64 {
            return Err(Self::malformed(format!("length {} exceeds i32::MAX", length)));
        }
        Ok(length as usize)
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x02 {
            return Err(Self::malformed(format!("expected INTEGER tag, got 0x{:02X}", tag)));
        }
        self.read_integer_value()
    }

    fn read_integer_value(&mut self) -> Result<i32> {
        let length = self.read_length()?;
        if length == 0 || length > 4 {
            return Err(Self::malformed(format!("integer of {} bytes", length)));
        }
        let bytes = self.read_raw_bytes(length)?;
        let mut value = 0i32;
        for &b in &bytes {
            value = (value << 8) | b as i32;
        }
        if length < 4 && (bytes[0] & 0x80) != 0 {
            value |= !0 << (length * 8);
        }
        Ok(value)
    }

    /// ENUMERATED as u32; AD can send result codes wider than one byte.
    fn read_enumerated(&mut self) -> Result<u32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x0A {
            return Err(Self::malformed(format!("expected ENUMERATED tag, got 0x{:02X}", tag)));
        }
        let length = self.read_length()?;
        if length == 0 || length > 4 {
            return Err(Self::malformed(format!("enumerated of {} bytes", length)));
        }
        let bytes = self.read_raw_bytes(length)?;
        let mut value = 0u32;
        for &b in &bytes {
            value = (value << 8) | b as u32;
        }
        Ok(value)
    }

    fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            return Err(Self::malformed(format!("expected BOOLEAN tag, got 0x{:02X}", tag)));
        }
        self.read_boolean_value()
    }

    fn read_boolean_value(&mut self) -> Result<bool> {
        let length = self.read_length()?;
        if length != 1 {
            return Err(Self::malformed(format!("boolean of {} bytes", length)));
        }
        let bytes = self.read_raw_bytes(1)?;
        Ok(bytes[0] != 0)
    }

    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x04 {
            return Err(Self::malformed(format!(
                "expected OCTET STRING tag, got 0x{:02X}",
                tag
            )));
        }
        self.read_octet_string_value()
    }

    /// Length + value only; use after read_tag() for IMPLICIT context tags.
    pub(crate) fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        self.read_raw_bytes(length)
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).map_err(|_| Self::malformed("invalid UTF-8 string"))
    }

    pub(crate) fn read_string_value(&mut self) -> Result<String> {
        let bytes = self.read_octet_string_value()?;
        String::from_utf8(bytes).map_err(|_| Self::malformed("invalid UTF-8 string"))
    }

    /// Read a SEQUENCE header and return the position one past its content.
    pub(crate) fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x10 {
            return Err(Self::malformed(format!("expected SEQUENCE tag, got 0x{:02X}", tag)));
        }
        let len = self.read_length()?;
        self.content_end(len)
    }

    /// End position for a TLV whose tag was already consumed.
    pub(crate) fn read_content_end(&mut self) -> Result<usize> {
        let len = self.read_length()?;
        self.content_end(len)
    }

    fn content_end(&self, len: usize) -> Result<usize> {
        let end = self.position() + len;
        if end > self.cursor.get_ref().len() {
            return Err(Self::malformed(format!(
                "truncated: element claims {} bytes, {} remaining",
                len,
                self.remaining()
            )));
        }
        Ok(end)
    }

    pub(crate) fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    fn read_raw_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            return Err(Self::malformed(format!(
                "truncated: need {} bytes, {} remaining",
                n,
                self.remaining()
            )));
        }
        let mut buf = vec![0u8; n];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| Self::malformed("truncated read"))?;
        Ok(buf)
    }

    /// Skip one whole TLV (tag, length, content). Used for peer protocol
    /// extensions we do not understand.
    fn skip_element(&mut self) -> Result<()> {
        let _tag = self.read_tag()?;
        let len = self.read_length()?;
        let _ = self.read_raw_bytes(len)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BER encoding utilities

pub struct BerWriter {
    buffer: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buffer.push(length as u8);
        } else {
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tagged_int(0x02, value);
    }

    pub fn write_enumerated(&mut self, value: u32) {
        // Result codes are non-negative; encode minimally.
        self.write_tagged_int(0x0A, value as i32);
    }

    fn write_tagged_int(&mut self, tag: u8, value: i32) {
        self.write_tag(tag);
        let bytes = value.to_be_bytes();
        let skip = if value >= 0 {
            bytes
                .iter()
                .position(|&b| b != 0)
                .unwrap_or(3)
                .min(3)
        } else {
            bytes.iter().position(|&b| b != 0xFF).unwrap_or(3).min(3)
        };
        let content = &bytes[skip..];
        // Minimal encoding must keep the sign bit correct.
        let needs_pad = (value >= 0 && content[0] & 0x80 != 0)
            || (value < 0 && skip > 0 && content[0] & 0x80 == 0);
        if needs_pad {
            self.write_length(content.len() + 1);
            self.buffer.push(if value >= 0 { 0x00 } else { 0xFF });
        } else {
            self.write_length(content.len());
        }
        self.buffer.extend_from_slice(content);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tag(0x04);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    /// Context-tagged IMPLICIT OCTET STRING, e.g. [0] requestName.
    pub fn write_context_string(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    /// Reserve a length byte (no tag). Call patch_length(pos) after
    /// writing the content. Used for [APPLICATION n] IMPLICIT SEQUENCE
    /// and constructed context tags.
    pub fn write_length_placeholder(&mut self) -> usize {
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch the length at pos for content written after the
    /// placeholder. Supports short and long form.
    pub fn patch_length(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let mut bytes = Vec::new();
            let mut len = content_len;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            for (i, b) in bytes.iter().enumerate() {
                self.buffer.insert(pos + 1 + i, *b);
            }
        }
    }

    pub fn start_sequence(&mut self) -> usize {
        self.write_tag(0x30);
        self.write_length_placeholder()
    }

    pub fn end_sequence(&mut self, length_pos: usize) {
        self.patch_length(length_pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// ---------------------------------------------------------------------------
// Message encoding

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(message.message_id);
    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::BindResponse(resp) => encode_bind_response(&mut writer, resp),
        ProtocolOp::UnbindRequest => {
            writer.write_tag(LDAP_TAG_UNBIND_REQUEST);
            writer.write_length_placeholder();
            Ok(())
        }
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req),
        ProtocolOp::SearchResultEntry(entry) => encode_search_result_entry(&mut writer, entry),
        ProtocolOp::SearchResultDone(done) => {
            writer.write_tag(LDAP_TAG_SEARCH_RESULT_DONE);
            let len_pos = writer.write_length_placeholder();
            encode_ldap_result(&mut writer, &done.result);
            writer.patch_length(len_pos);
            Ok(())
        }
        ProtocolOp::SearchResultReference(uris) => {
            writer.write_tag(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            let len_pos = writer.write_length_placeholder();
            for uri in uris {
                writer.write_string(uri);
            }
            writer.patch_length(len_pos);
            Ok(())
        }
        ProtocolOp::ExtendedRequest(req) => encode_extended_request(&mut writer, req),
        ProtocolOp::ExtendedResponse(resp) => encode_extended_response(&mut writer, resp),
    }?;
    if let Some(controls) = &message.controls {
        encode_controls(&mut writer, controls);
    }
    writer.end_sequence(seq);
    Ok(writer.into_vec())
}

fn encode_ldap_result(writer: &mut BerWriter, result: &LdapResult) {
    writer.write_enumerated(result.result_code.as_u32());
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostics_message);
    if let Some(refs) = &result.referrals {
        // [3] Referral ::= SEQUENCE SIZE (1..MAX) OF uri
        writer.write_tag(0xA3);
        let len_pos = writer.write_length_placeholder();
        for uri in refs {
            writer.write_string(uri);
        }
        writer.patch_length(len_pos);
    }
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) -> Result<()> {
    writer.write_tag(LDAP_TAG_BIND_REQUEST);
    let len_pos = writer.write_length_placeholder();
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    match &req.authentication {
        BindAuthentication::Simple(password) => {
            // simple [0] IMPLICIT OCTET STRING
            writer.write_context_string(0x80, password.as_bytes());
        }
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            // sasl [3] SaslCredentials ::= SEQUENCE { mechanism, credentials OPTIONAL }
            writer.write_tag(0xA3);
            let sasl_pos = writer.write_length_placeholder();
            writer.write_string(mechanism);
            if let Some(creds) = credentials {
                writer.write_octet_string(creds);
            }
            writer.patch_length(sasl_pos);
        }
    }
    writer.patch_length(len_pos);
    Ok(())
}

fn encode_bind_response(writer: &mut BerWriter, resp: &BindResponse) -> Result<()> {
    writer.write_tag(LDAP_TAG_BIND_RESPONSE);
    let len_pos = writer.write_length_placeholder();
    encode_ldap_result(writer, &resp.result);
    if let Some(creds) = &resp.server_sasl_creds {
        // serverSaslCreds [7] IMPLICIT OCTET STRING
        writer.write_context_string(0x87, creds);
    }
    writer.patch_length(len_pos);
    Ok(())
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) -> Result<()> {
    writer.write_tag(LDAP_TAG_SEARCH_REQUEST);
    let len_pos = writer.write_length_placeholder();
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as u32);
    writer.write_enumerated(req.deref_aliases as u32);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    req.filter.write_ber(writer)?;
    let attrs_pos = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end_sequence(attrs_pos);
    writer.patch_length(len_pos);
    Ok(())
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) -> Result<()> {
    writer.write_tag(LDAP_TAG_SEARCH_RESULT_ENTRY);
    let len_pos = writer.write_length_placeholder();
    writer.write_string(&entry.object_name);
    let attrs_pos = writer.start_sequence();
    for attr in &entry.attributes {
        let attr_pos = writer.start_sequence();
        writer.write_string(&attr.name);
        // vals SET OF value
        writer.write_tag(0x31);
        let set_pos = writer.write_length_placeholder();
        for value in &attr.values {
            writer.write_octet_string(value);
        }
        writer.patch_length(set_pos);
        writer.end_sequence(attr_pos);
    }
    writer.end_sequence(attrs_pos);
    writer.patch_length(len_pos);
    Ok(())
}

fn encode_extended_request(writer: &mut BerWriter, req: &ExtendedRequest) -> Result<()> {
    writer.write_tag(LDAP_TAG_EXTENDED_REQUEST);
    let len_pos = writer.write_length_placeholder();
    writer.write_context_string(0x80, req.request_name.as_bytes());
    if let Some(value) = &req.request_value {
        writer.write_context_string(0x81, value);
    }
    writer.patch_length(len_pos);
    Ok(())
}

fn encode_extended_response(writer: &mut BerWriter, resp: &ExtendedResponse) -> Result<()> {
    writer.write_tag(LDAP_TAG_EXTENDED_RESPONSE);
    let len_pos = writer.write_length_placeholder();
    encode_ldap_result(writer, &resp.result);
    if let Some(name) = &resp.response_name {
        writer.write_context_string(0x8A, name.as_bytes());
    }
    if let Some(value) = &resp.response_value {
        writer.write_context_string(0x8B, value);
    }
    writer.patch_length(len_pos);
    Ok(())
}

fn encode_controls(writer: &mut BerWriter, controls: &[Control]) {
    writer.write_tag(LDAP_CONTEXT_CONTROLS);
    let len_pos = writer.write_length_placeholder();
    for control in controls {
        let ctrl_pos = writer.start_sequence();
        writer.write_string(&control.control_type);
        if control.criticality {
            // DEFAULT FALSE: only encoded when true
            writer.write_boolean(true);
        }
        if let Some(value) = &control.value {
            writer.write_octet_string(value);
        }
        writer.end_sequence(ctrl_pos);
    }
    writer.patch_length(len_pos);
}

// ---------------------------------------------------------------------------
// Message decoding

/// Decode exactly one LDAPMessage from the front of `data`. The caller
/// is expected to have established completeness with [`scan_pdu`];
/// truncation inside a complete-looking PDU is malformed.
pub fn decode_ldap_message(data: &[u8]) -> Result<(LdapMessage, usize)> {
    let mut reader = BerReader::new(data);
    let first = reader.peek_tag().ok_or_else(|| LdapError::Malformed("empty buffer".into()))?;
    if first != LDAP_MESSAGE_SEQUENCE_TAG {
        return Err(LdapError::Malformed(format!(
            "LDAPMessage must start with SEQUENCE, got 0x{:02X}",
            first
        )));
    }
    let msg_end = reader.read_sequence()?;
    let message_id = reader.read_integer()?;

    let tag = reader.read_tag()?;
    let mut protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(&mut reader)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(&mut reader)?),
        LDAP_TAG_UNBIND_REQUEST => {
            let end = reader.read_content_end()?;
            let _ = reader.read_raw_bytes(end - reader.position())?;
            ProtocolOp::UnbindRequest
        }
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(&mut reader)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => {
            ProtocolOp::SearchResultEntry(parse_search_result_entry(&mut reader)?)
        }
        LDAP_TAG_SEARCH_RESULT_DONE => {
            let end = reader.read_content_end()?;
            let result = parse_ldap_result(&mut reader, end)?;
            ProtocolOp::SearchResultDone(SearchResultDone { result })
        }
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            let end = reader.read_content_end()?;
            let mut uris = Vec::new();
            while reader.position() < end {
                uris.push(reader.read_string()?);
            }
            ProtocolOp::SearchResultReference(uris)
        }
        LDAP_TAG_EXTENDED_REQUEST => {
            ProtocolOp::ExtendedRequest(parse_extended_request(&mut reader)?)
        }
        LDAP_TAG_EXTENDED_RESPONSE => {
            ProtocolOp::ExtendedResponse(parse_extended_response(&mut reader)?)
        }
        other => {
            return Err(LdapError::Malformed(format!(
                "unsupported protocolOp tag 0x{:02X}",
                other
            )))
        }
    };

    // Trailing elements: [0] controls, the AD dialect's stray [10]
    // responseName, and unknown peer extensions (skipped).
    let mut controls = None;
    while reader.position() < msg_end {
        match reader.peek_tag() {
            Some(LDAP_CONTEXT_CONTROLS) => {
                let _ = reader.read_tag()?;
                controls = Some(parse_controls(&mut reader)?);
            }
            Some(0x8A) => {
                // Some AD servers put responseName directly under
                // LDAPMessage instead of inside ExtendedResponse.
                let _ = reader.read_tag()?;
                let name = reader.read_string_value()?;
                if let ProtocolOp::ExtendedResponse(ref mut resp) = protocol_op {
                    if resp.response_name.is_none() {
                        resp.response_name = Some(name);
                    }
                }
            }
            Some(_) => {
                reader.skip_element()?;
            }
            None => break,
        }
    }

    Ok((
        LdapMessage {
            message_id,
            protocol_op,
            controls,
        },
        msg_end,
    ))
}

fn parse_ldap_result(reader: &mut BerReader, end: usize) -> Result<LdapResult> {
    let result_code = ResultCode::from_u32(reader.read_enumerated()?);
    let matched_dn = reader.read_string()?;
    let diagnostics_message = reader.read_string()?;
    let referrals = if reader.position() < end && reader.peek_tag() == Some(0xA3) {
        let _ = reader.read_tag()?;
        let ref_end = reader.read_content_end()?;
        let mut uris = Vec::new();
        while reader.position() < ref_end {
            uris.push(reader.read_string()?);
        }
        Some(uris)
    } else {
        None
    };
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostics_message,
        referrals,
    })
}

fn parse_bind_request(reader: &mut BerReader) -> Result<BindRequest> {
    let _end = reader.read_content_end()?;
    let version = reader.read_integer()?;
    let name = reader.read_string()?;
    let auth_tag = reader.read_tag()?;
    let authentication = if auth_tag == 0xA3 {
        let sasl_end = reader.read_content_end()?;
        let mechanism = reader.read_string()?;
        let credentials = if reader.position() < sasl_end {
            Some(reader.read_octet_string()?)
        } else {
            None
        };
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        }
    } else if auth_tag == 0x80 {
        let password = reader.read_octet_string_value()?;
        BindAuthentication::Simple(
            String::from_utf8(password)
                .map_err(|_| LdapError::Malformed("non-UTF-8 simple password".into()))?,
        )
    } else {
        return Err(LdapError::Malformed(format!(
            "unsupported bind authentication tag 0x{:02X}",
            auth_tag
        )));
    };
    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_bind_response(reader: &mut BerReader) -> Result<BindResponse> {
    let end = reader.read_content_end()?;
    let result = parse_ldap_result(reader, end)?;
    let server_sasl_creds = if reader.position() < end && reader.peek_tag() == Some(0x87) {
        let _ = reader.read_tag()?;
        Some(reader.read_octet_string_value()?)
    } else {
        None
    };
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

fn parse_search_request(reader: &mut BerReader) -> Result<SearchRequest> {
    let end = reader.read_content_end()?;
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = DerefAliases::try_from(reader.read_enumerated()?)?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = Filter::read_ber(reader)?;
    let mut attributes = Vec::new();
    if reader.position() < end {
        let attrs_end = reader.read_sequence()?;
        while reader.position() < attrs_end {
            attributes.push(reader.read_string()?);
        }
    }
    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_search_result_entry(reader: &mut BerReader) -> Result<SearchResultEntry> {
    let _end = reader.read_content_end()?;
    let object_name = reader.read_string()?;
    let attrs_end = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while reader.position() < attrs_end {
        let attr_end = reader.read_sequence()?;
        let name = reader.read_string()?;
        let set_tag = reader.read_tag()?;
        if (set_tag & 0x1F) != 0x11 {
            return Err(LdapError::Malformed(format!(
                "expected SET tag in attribute values, got 0x{:02X}",
                set_tag
            )));
        }
        let set_end = reader.read_content_end()?;
        let mut values = Vec::new();
        while reader.position() < set_end {
            values.push(reader.read_octet_string()?);
        }
        let _ = attr_end;
        attributes.push(PartialAttribute { name, values });
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_extended_request(reader: &mut BerReader) -> Result<ExtendedRequest> {
    let end = reader.read_content_end()?;
    let name_tag = reader.read_tag()?;
    if name_tag != 0x80 {
        return Err(LdapError::Malformed(format!(
            "expected [0] requestName, got 0x{:02X}",
            name_tag
        )));
    }
    let request_name = reader.read_string_value()?;
    let request_value = if reader.position() < end && reader.peek_tag() == Some(0x81) {
        let _ = reader.read_tag()?;
        Some(reader.read_octet_string_value()?)
    } else {
        None
    };
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(reader: &mut BerReader) -> Result<ExtendedResponse> {
    let end = reader.read_content_end()?;
    let result = parse_ldap_result(reader, end)?;
    let mut response_name = None;
    let mut response_value = None;
    while reader.position() < end {
        match reader.peek_tag() {
            Some(0x8A) => {
                let _ = reader.read_tag()?;
                response_name = Some(reader.read_string_value()?);
            }
            Some(0x8B) => {
                let _ = reader.read_tag()?;
                response_value = Some(reader.read_octet_string_value()?);
            }
            _ => {
                reader.skip_element()?;
            }
        }
    }
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

/// Controls ::= SEQUENCE OF Control; the [0] wrapper tag was consumed.
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let end = reader.read_content_end()?;
    let mut controls = Vec::new();
    while reader.position() < end {
        let ctrl_end = reader.read_sequence()?;
        let control_type = reader.read_string()?;
        let mut criticality = false;
        let mut value = None;
        while reader.position() < ctrl_end {
            match reader.peek_tag() {
                Some(t) if (t & 0x1F) == 0x01 => {
                    let _ = reader.read_tag()?;
                    criticality = reader.read_boolean_value()?;
                }
                Some(t) if (t & 0x1F) == 0x04 => {
                    let _ = reader.read_tag()?;
                    value = Some(reader.read_octet_string_value()?);
                }
                _ => {
                    reader.skip_element()?;
                }
            }
        }
        controls.push(Control {
            control_type,
            criticality,
            value,
        });
    }
    Ok(controls)
}
