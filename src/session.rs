// Session layer: tracks the connection's lifecycle state, allocates
// message ids, and turns operations into encoded LDAPMessage bytes.
// Transport concerns (sockets, TLS, security layer) live elsewhere;
// everything here is pure state plus the codec.

use crate::error::{LdapError, Result};
use crate::filter::Filter;
use crate::protocol::{
    self, BindAuthentication, BindRequest, Control, DerefAliases, ExtendedRequest, LdapMessage,
    ProtocolOp, SearchRequest, SearchScope,
};
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const LDAP_VERSION: i32 = 3;

/// Lifecycle of one LDAP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport established, no bind yet. Anonymous operations are
    /// permitted here.
    Connected,
    /// A bind is outstanding. RFC 4511 §4.2.1 forbids other requests
    /// until it resolves, so everything but bind continuations is
    /// rejected.
    Binding,
    /// Bind completed successfully.
    Bound,
    /// Unbind was sent; the connection is done.
    Closed,
}

/// Parameters for a search, with RFC 4511 defaults filled in.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub attributes: Vec<String>,
}

impl SearchOptions {
    pub fn subtree(base_object: impl Into<String>) -> Self {
        Self {
            base_object: base_object.into(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            attributes: Vec::new(),
        }
    }

    pub fn attributes(mut self, attrs: &[&str]) -> Self {
        self.attributes = attrs.iter().map(|a| a.to_string()).collect();
        self
    }
}

pub struct Session {
    next_id: AtomicI32,
    state: Mutex<ConnectionState>,
}

/// An encoded request ready for the wire.
pub struct OutboundRequest {
    pub message_id: i32,
    pub bytes: Vec<u8>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            state: Mutex::new(ConnectionState::Connected),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    fn allocate_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn encode(&self, message_id: i32, op: ProtocolOp, controls: Option<Vec<Control>>) -> Result<OutboundRequest> {
        let bytes = protocol::encode_ldap_message(&LdapMessage {
            message_id,
            protocol_op: op,
            controls,
        })?;
        Ok(OutboundRequest { message_id, bytes })
    }

    /// Simple bind. Moves the session into Binding; callers report the
    /// outcome with [`complete_bind`](Self::complete_bind).
    pub fn simple_bind_request(&self, name: &str, password: &str) -> Result<OutboundRequest> {
        self.begin_bind()?;
        self.encode(
            self.allocate_id(),
            ProtocolOp::BindRequest(BindRequest {
                version: LDAP_VERSION,
                name: name.to_string(),
                authentication: BindAuthentication::Simple(password.to_string()),
            }),
            None,
        )
    }

    /// One step of a SASL bind. Multi-step mechanisms call this again
    /// from the Binding state with the next token.
    pub fn sasl_bind_request(
        &self,
        name: &str,
        mechanism: &str,
        credentials: Option<Vec<u8>>,
    ) -> Result<OutboundRequest> {
        self.begin_bind()?;
        self.encode(
            self.allocate_id(),
            ProtocolOp::BindRequest(BindRequest {
                version: LDAP_VERSION,
                name: name.to_string(),
                authentication: BindAuthentication::Sasl {
                    mechanism: mechanism.to_string(),
                    credentials,
                },
            }),
            None,
        )
    }

    fn begin_bind(&self) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            ConnectionState::Connected | ConnectionState::Bound | ConnectionState::Binding => {
                *state = ConnectionState::Binding;
                Ok(())
            }
            ConnectionState::Closed => Err(LdapError::InvalidState(
                "cannot bind on a closed session".to_string(),
            )),
        }
    }

    /// Resolve an outstanding bind. `bound` is true only for a final
    /// success result; SaslBindInProgress and failures both keep or
    /// drop back to the pre-bind state.
    pub fn complete_bind(&self, bound: bool) {
        let mut state = self.lock_state();
        if *state == ConnectionState::Binding {
            *state = if bound {
                ConnectionState::Bound
            } else {
                ConnectionState::Connected
            };
        }
    }

    /// True while a SASL conversation is mid-flight.
    pub fn is_binding(&self) -> bool {
        *self.lock_state() == ConnectionState::Binding
    }

    pub fn search_request(
        &self,
        options: &SearchOptions,
        filter: Filter,
        controls: Option<Vec<Control>>,
    ) -> Result<OutboundRequest> {
        self.require_open()?;
        self.encode(
            self.allocate_id(),
            ProtocolOp::SearchRequest(SearchRequest {
                base_object: options.base_object.clone(),
                scope: options.scope,
                deref_aliases: options.deref_aliases,
                size_limit: options.size_limit,
                time_limit: options.time_limit,
                types_only: options.types_only,
                filter,
                attributes: options.attributes.clone(),
            }),
            controls,
        )
    }

    pub fn extended_request(
        &self,
        request_name: &str,
        request_value: Option<Vec<u8>>,
    ) -> Result<OutboundRequest> {
        self.require_open()?;
        self.encode(
            self.allocate_id(),
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: request_name.to_string(),
                request_value,
            }),
            None,
        )
    }

    /// Unbind has no response; the session is Closed as soon as the
    /// request is produced.
    pub fn unbind_request(&self) -> Result<OutboundRequest> {
        let mut state = self.lock_state();
        if *state == ConnectionState::Closed {
            return Err(LdapError::InvalidState(
                "session already closed".to_string(),
            ));
        }
        *state = ConnectionState::Closed;
        drop(state);
        self.encode(self.allocate_id(), ProtocolOp::UnbindRequest, None)
    }

    fn require_open(&self) -> Result<()> {
        match *self.lock_state() {
            ConnectionState::Connected | ConnectionState::Bound => Ok(()),
            ConnectionState::Binding => Err(LdapError::InvalidState(
                "a bind is in progress".to_string(),
            )),
            ConnectionState::Closed => Err(LdapError::InvalidState(
                "session is closed".to_string(),
            )),
        }
    }
}

/// Pop one complete LDAPMessage off the front of the reassembly
/// buffer. Ok(None) means more bytes are needed; malformed framing is
/// fatal for the connection.
pub fn extract_message(buffer: &mut BytesMut) -> Result<Option<LdapMessage>> {
    match protocol::scan_pdu(buffer) {
        protocol::PduScan::Incomplete => Ok(None),
        protocol::PduScan::Malformed(reason) => Err(LdapError::Malformed(reason)),
        protocol::PduScan::Complete { total_len } => {
            let (message, consumed) = protocol::decode_ldap_message(&buffer[..total_len])?;
            debug_assert!(consumed <= total_len);
            buffer.advance(total_len);
            Ok(Some(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn message_ids_start_at_one_and_increase() {
        let session = Session::new();
        let first = session
            .search_request(&SearchOptions::subtree("dc=t"), Filter::Present("cn".into()), None)
            .unwrap();
        assert_eq!(first.message_id, 1);
        let mut seen = HashSet::new();
        seen.insert(first.message_id);
        let mut last = first.message_id;
        for _ in 0..100 {
            let req = session
                .search_request(&SearchOptions::subtree("dc=t"), Filter::Present("cn".into()), None)
                .unwrap();
            assert!(req.message_id > last);
            assert!(seen.insert(req.message_id));
            last = req.message_id;
        }
    }

    #[test]
    fn bind_state_transitions() {
        let session = Session::new();
        assert_eq!(session.state(), ConnectionState::Connected);
        session.simple_bind_request("cn=admin", "pw").unwrap();
        assert_eq!(session.state(), ConnectionState::Binding);
        session.complete_bind(true);
        assert_eq!(session.state(), ConnectionState::Bound);
    }

    #[test]
    fn failed_bind_returns_to_connected() {
        let session = Session::new();
        session.simple_bind_request("cn=admin", "bad").unwrap();
        session.complete_bind(false);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[test]
    fn sasl_continuation_stays_in_binding() {
        let session = Session::new();
        session
            .sasl_bind_request("", "GSS-SPNEGO", Some(vec![1, 2, 3]))
            .unwrap();
        assert!(session.is_binding());
        // next token while still binding is allowed
        session
            .sasl_bind_request("", "GSS-SPNEGO", Some(vec![4, 5]))
            .unwrap();
        assert!(session.is_binding());
    }

    #[test]
    fn requests_rejected_while_binding() {
        let session = Session::new();
        session.simple_bind_request("cn=a", "pw").unwrap();
        assert!(matches!(
            session.search_request(
                &SearchOptions::subtree("dc=t"),
                Filter::Present("cn".into()),
                None
            ),
            Err(LdapError::InvalidState(_))
        ));
        assert!(matches!(
            session.extended_request("1.2.3", None),
            Err(LdapError::InvalidState(_))
        ));
    }

    #[test]
    fn anonymous_search_allowed_before_bind() {
        let session = Session::new();
        assert!(session
            .search_request(&SearchOptions::subtree("dc=t"), Filter::Present("cn".into()), None)
            .is_ok());
    }

    #[test]
    fn unbind_closes_the_session() {
        let session = Session::new();
        session.unbind_request().unwrap();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(matches!(
            session.unbind_request(),
            Err(LdapError::InvalidState(_))
        ));
        assert!(matches!(
            session.simple_bind_request("cn=a", "pw"),
            Err(LdapError::InvalidState(_))
        ));
    }

    #[test]
    fn extract_message_handles_partial_and_complete() {
        let session = Session::new();
        let req = session.simple_bind_request("cn=a", "pw").unwrap();
        let mut buffer = BytesMut::new();

        // feed all but the last byte
        buffer.extend_from_slice(&req.bytes[..req.bytes.len() - 1]);
        assert!(extract_message(&mut buffer).unwrap().is_none());

        // the final byte completes the PDU
        buffer.extend_from_slice(&req.bytes[req.bytes.len() - 1..]);
        let message = extract_message(&mut buffer).unwrap().unwrap();
        assert_eq!(message.message_id, req.message_id);
        assert!(buffer.is_empty());
    }

    #[test]
    fn extract_message_surfaces_malformed_framing() {
        let mut buffer = BytesMut::from(&[0x30u8, 0xFF][..]);
        assert!(matches!(
            extract_message(&mut buffer),
            Err(LdapError::Malformed(_))
        ));
    }

    #[test]
    fn extract_message_pops_back_to_back_pdus() {
        let session = Session::new();
        let a = session.simple_bind_request("cn=a", "pw").unwrap();
        session.complete_bind(true);
        let b = session.extended_request("1.3.6.1.4.1.4203.1.11.3", None).unwrap();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&a.bytes);
        buffer.extend_from_slice(&b.bytes);
        assert_eq!(
            extract_message(&mut buffer).unwrap().unwrap().message_id,
            a.message_id
        );
        assert_eq!(
            extract_message(&mut buffer).unwrap().unwrap().message_id,
            b.message_id
        );
        assert!(buffer.is_empty());
    }
}
