// SASL security layer framing (RFC 4422 §3.7). Once a layer is
// negotiated, every LDAP PDU travels as a 4-byte big-endian length
// followed by the wrapped (signed or sealed) payload. Before that, the
// processor is a transparent pass-through.

use crate::error::{LdapError, Result};
use bytes::{BufMut, BytesMut};

/// Upper bound on a single wrapped frame. A length prefix beyond this
/// means a desynchronized or hostile peer, not a large result.
const MAX_WRAPPED_FRAME: usize = 16 * 1024 * 1024;

/// A negotiated SASL security layer. Implementations carry the keys
/// and sequence state from the bind negotiation. `confidential` asks
/// for sealing (encryption); false means sign-only, and the payload
/// comes back with just an integrity trailer.
pub trait SecurityContext: Send + Sync {
    fn wrap(&self, plaintext: &[u8], confidential: bool) -> Result<Vec<u8>>;
    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>>;
}

/// Applies the optional security layer in both directions and
/// reassembles inbound frames across arbitrary read fragmentation.
pub struct FrameProcessor {
    security: Option<Box<dyn SecurityContext>>,
    seal: bool,
    pending: BytesMut,
}

impl Default for FrameProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameProcessor {
    pub fn new() -> Self {
        Self {
            security: None,
            seal: false,
            pending: BytesMut::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.security.is_some()
    }

    /// Install a negotiated layer. `seal` selects confidentiality for
    /// outbound wraps; false means sign-only. Bytes already sitting in
    /// the reassembly buffer were received before the layer took
    /// effect and must have been drained by the caller first.
    pub fn install(&mut self, context: Box<dyn SecurityContext>, seal: bool) -> Result<()> {
        if self.security.is_some() {
            return Err(LdapError::InvalidState(
                "security layer already installed".to_string(),
            ));
        }
        self.security = Some(context);
        self.seal = seal;
        Ok(())
    }

    /// Transform one outbound PDU into its on-wire form.
    pub fn encode_outbound(&self, pdu: &[u8]) -> Result<Vec<u8>> {
        match &self.security {
            None => Ok(pdu.to_vec()),
            Some(ctx) => {
                let wrapped = ctx.wrap(pdu, self.seal)?;
                let mut framed = Vec::with_capacity(4 + wrapped.len());
                framed.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
                framed.extend_from_slice(&wrapped);
                Ok(framed)
            }
        }
    }

    /// Feed raw socket bytes in; complete plaintext is appended to
    /// `out`. Partial frames stay buffered until more data arrives.
    pub fn decode_inbound(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        let ctx = match &self.security {
            None => {
                out.put_slice(data);
                return Ok(());
            }
            Some(ctx) => ctx,
        };
        self.pending.put_slice(data);
        loop {
            if self.pending.len() < 4 {
                return Ok(());
            }
            let frame_len = u32::from_be_bytes([
                self.pending[0],
                self.pending[1],
                self.pending[2],
                self.pending[3],
            ]) as usize;
            if frame_len > MAX_WRAPPED_FRAME {
                return Err(LdapError::SecurityLayer(format!(
                    "wrapped frame of {} bytes exceeds limit",
                    frame_len
                )));
            }
            if self.pending.len() < 4 + frame_len {
                return Ok(());
            }
            let frame = self.pending.split_to(4 + frame_len);
            let plaintext = ctx.unwrap(&frame[4..])?;
            out.put_slice(&plaintext);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Toy layer: prepends a marker byte recording the confidentiality
    /// request and XORs the payload, so wrapped bytes never equal
    /// plaintext and bad input is detectable.
    struct XorLayer;

    const MARKER_SIGNED: u8 = 0x5A;
    const MARKER_SEALED: u8 = 0x5B;

    impl SecurityContext for XorLayer {
        fn wrap(&self, plaintext: &[u8], confidential: bool) -> Result<Vec<u8>> {
            let mut out = Vec::with_capacity(plaintext.len() + 1);
            out.push(if confidential { MARKER_SEALED } else { MARKER_SIGNED });
            out.extend(plaintext.iter().map(|b| b ^ 0x42));
            Ok(out)
        }

        fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
            match wrapped.first() {
                Some(&MARKER_SIGNED) | Some(&MARKER_SEALED) => {
                    Ok(wrapped[1..].iter().map(|b| b ^ 0x42).collect())
                }
                _ => Err(LdapError::SecurityLayer("bad frame marker".to_string())),
            }
        }
    }

    fn active_processor() -> FrameProcessor {
        let mut p = FrameProcessor::new();
        p.install(Box::new(XorLayer), false).unwrap();
        p
    }

    #[test]
    fn seal_flag_reaches_the_layer() {
        let mut p = FrameProcessor::new();
        p.install(Box::new(XorLayer), true).unwrap();
        let framed = p.encode_outbound(b"x").unwrap();
        assert_eq!(framed[4], MARKER_SEALED);
        let signed = active_processor().encode_outbound(b"x").unwrap();
        assert_eq!(signed[4], MARKER_SIGNED);
    }

    #[test]
    fn passthrough_copies_both_directions() {
        let mut p = FrameProcessor::new();
        assert!(!p.is_active());
        assert_eq!(p.encode_outbound(b"abc").unwrap(), b"abc");
        let mut out = BytesMut::new();
        p.decode_inbound(b"abc", &mut out).unwrap();
        assert_eq!(&out[..], b"abc");
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let mut p = active_processor();
        let framed = p.encode_outbound(b"hello pdu").unwrap();
        assert_eq!(
            u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize,
            framed.len() - 4
        );
        let mut out = BytesMut::new();
        p.decode_inbound(&framed, &mut out).unwrap();
        assert_eq!(&out[..], b"hello pdu");
    }

    #[test]
    fn roundtrip_empty_payload() {
        let mut p = active_processor();
        let framed = p.encode_outbound(b"").unwrap();
        let mut out = BytesMut::new();
        p.decode_inbound(&framed, &mut out).unwrap();
        assert!(out.is_empty());
        assert!(p.pending.is_empty());
    }

    #[test]
    fn roundtrip_large_payload() {
        let payload = vec![0xABu8; 70_000];
        let mut p = active_processor();
        let framed = p.encode_outbound(&payload).unwrap();
        let mut out = BytesMut::new();
        p.decode_inbound(&framed, &mut out).unwrap();
        assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn reassembles_fragmented_frames() {
        let mut p = active_processor();
        let mut wire = p.encode_outbound(b"first").unwrap();
        wire.extend(p.encode_outbound(b"second").unwrap());
        let mut out = BytesMut::new();
        // one byte at a time, including a split inside the length prefix
        for b in &wire {
            p.decode_inbound(std::slice::from_ref(b), &mut out).unwrap();
        }
        assert_eq!(&out[..], b"firstsecond");
    }

    #[test]
    fn rejects_oversized_frame_length() {
        let mut p = active_processor();
        let mut out = BytesMut::new();
        let err = p
            .decode_inbound(&[0xFF, 0xFF, 0xFF, 0xFF], &mut out)
            .unwrap_err();
        assert!(matches!(err, LdapError::SecurityLayer(_)));
    }

    #[test]
    fn rejects_double_install() {
        let mut p = active_processor();
        assert!(matches!(
            p.install(Box::new(XorLayer), false),
            Err(LdapError::InvalidState(_))
        ));
    }

    #[test]
    fn unwrap_failure_propagates() {
        let mut p = active_processor();
        let mut out = BytesMut::new();
        // valid length prefix, garbage payload
        let err = p
            .decode_inbound(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00], &mut out)
            .unwrap_err();
        assert!(matches!(err, LdapError::SecurityLayer(_)));
    }
}
