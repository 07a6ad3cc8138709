// Public connection facade: dials the server (ldap:// or ldaps://),
// owns the session, dispatcher and transport handle, and exposes the
// protocol operations.

use crate::config::ConnectionSettings;
use crate::dispatcher::RequestDispatcher;
use crate::error::{LdapError, Result};
use crate::filter::Filter;
use crate::framing::SecurityContext;
use crate::protocol::{
    ExtendedResponse, LdapMessage, ProtocolOp, ResultCode, START_TLS_OID, WHOAMI_OID,
};
use crate::search::SearchStream;
use crate::session::{ConnectionState, OutboundRequest, SearchOptions, Session};
use crate::tls::{self, LdapScheme};
use crate::transport::{self, ConnStream, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of one SASL bind step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslBindOutcome {
    /// The mechanism completed; the session is bound.
    Complete { server_creds: Option<Vec<u8>> },
    /// The server expects another token from the client.
    InProgress { server_creds: Option<Vec<u8>> },
}

pub struct LdapConnection {
    session: Session,
    dispatcher: Arc<RequestDispatcher>,
    transport: Transport,
    cancel: CancellationToken,
    operation_timeout: Duration,
    settings: ConnectionSettings,
    host: String,
}

fn setup_error(err: anyhow::Error) -> LdapError {
    LdapError::Io(format!("{:#}", err))
}

impl LdapConnection {
    /// Establish the transport. An ldaps:// URL performs the TLS
    /// handshake immediately; an ldap:// URL with `tls.starttls: true`
    /// upgrades via the StartTLS extended operation right after
    /// connecting.
    pub async fn connect(settings: ConnectionSettings) -> Result<Self> {
        let (scheme, host, port) = tls::parse_ldap_uri(&settings.url).map_err(setup_error)?;
        debug!(url = %settings.url, "connecting");
        let tcp = tokio::time::timeout(
            settings.connect_timeout(),
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| LdapError::Timeout)??;
        tcp.set_nodelay(true)?;

        let stream = match scheme {
            LdapScheme::Plain => ConnStream::Tcp(tcp),
            LdapScheme::Tls => {
                let connector = connector_for(&settings)?;
                let name = tls::server_name(&host).map_err(setup_error)?;
                let tls = tokio::time::timeout(
                    settings.connect_timeout(),
                    connector.connect(name, tcp),
                )
                .await
                .map_err(|_| LdapError::Timeout)?
                .map_err(|e| LdapError::Io(format!("TLS handshake failed: {}", e)))?;
                ConnStream::Tls(Box::new(tls))
            }
        };

        let dispatcher = Arc::new(RequestDispatcher::new());
        let cancel = CancellationToken::new();
        let transport = transport::spawn_driver(stream, dispatcher.clone(), cancel.clone());
        let connection = Self {
            session: Session::new(),
            dispatcher,
            transport,
            cancel,
            operation_timeout: settings.operation_timeout(),
            settings,
            host,
        };
        info!(url = %connection.settings.url, "connected");

        if scheme == LdapScheme::Plain && connection.settings.use_starttls() {
            connection.start_tls().await?;
        }
        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Token cancelled when the connection dies; callers can use it to
    /// abandon their own waits.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send one request and await its single response message.
    async fn transact(&self, request: OutboundRequest) -> Result<LdapMessage> {
        let message_id = request.message_id;
        self.dispatcher.register(message_id)?;
        if let Err(err) = self.transport.send(request.bytes).await {
            self.dispatcher.remove(message_id);
            return Err(err);
        }
        let outcome = self
            .dispatcher
            .wait_for_message(message_id, self.operation_timeout, &self.cancel)
            .await;
        self.dispatcher.remove(message_id);
        outcome
    }

    /// Simple bind. Success moves the session to Bound.
    pub async fn simple_bind(&self, dn: &str, password: &str) -> Result<()> {
        let request = self.session.simple_bind_request(dn, password)?;
        let message = match self.transact(request).await {
            Ok(message) => message,
            Err(err) => {
                self.session.complete_bind(false);
                return Err(err);
            }
        };
        let ProtocolOp::BindResponse(response) = message.protocol_op else {
            self.session.complete_bind(false);
            return Err(LdapError::Malformed(format!(
                "unexpected response to bind: {:?}",
                message.protocol_op
            )));
        };
        match response.result.result_code {
            ResultCode::Success => {
                self.session.complete_bind(true);
                info!(dn, "bind succeeded");
                Ok(())
            }
            code => {
                self.session.complete_bind(false);
                Err(LdapError::OperationFailed {
                    code,
                    matched_dn: response.result.matched_dn,
                    message: response.result.diagnostics_message,
                })
            }
        }
    }

    /// One step of a SASL bind conversation. Call repeatedly with the
    /// mechanism's next token until the outcome is Complete. A
    /// mechanism that negotiated integrity or confidentiality should
    /// then install its layer with
    /// [`install_security_layer`](Self::install_security_layer).
    pub async fn sasl_bind_step(
        &self,
        name: &str,
        mechanism: &str,
        credentials: Option<Vec<u8>>,
    ) -> Result<SaslBindOutcome> {
        let request = self.session.sasl_bind_request(name, mechanism, credentials)?;
        let message = match self.transact(request).await {
            Ok(message) => message,
            Err(err) => {
                self.session.complete_bind(false);
                return Err(err);
            }
        };
        let ProtocolOp::BindResponse(response) = message.protocol_op else {
            self.session.complete_bind(false);
            return Err(LdapError::Malformed(format!(
                "unexpected response to bind: {:?}",
                message.protocol_op
            )));
        };
        match response.result.result_code {
            ResultCode::Success => {
                self.session.complete_bind(true);
                info!(mechanism, "SASL bind complete");
                Ok(SaslBindOutcome::Complete {
                    server_creds: response.server_sasl_creds,
                })
            }
            ResultCode::SaslBindInProgress => Ok(SaslBindOutcome::InProgress {
                server_creds: response.server_sasl_creds,
            }),
            code => {
                self.session.complete_bind(false);
                Err(LdapError::OperationFailed {
                    code,
                    matched_dn: response.result.matched_dn,
                    message: response.result.diagnostics_message,
                })
            }
        }
    }

    /// Activate the security layer a completed SASL bind negotiated.
    /// All traffic from this point on is wrapped; `seal` selects
    /// confidentiality over integrity-only protection.
    pub async fn install_security_layer(
        &self,
        context: Box<dyn SecurityContext>,
        seal: bool,
    ) -> Result<()> {
        self.transport.install_security(context, seal).await
    }

    /// StartTLS: extended operation followed by an in-place TLS
    /// handshake on the same TCP stream. Requires a quiet connection;
    /// outstanding operations make the upgrade ambiguous.
    pub async fn start_tls(&self) -> Result<()> {
        if self.dispatcher.pending_count() > 0 {
            return Err(LdapError::InvalidState(
                "cannot StartTLS with operations in flight".to_string(),
            ));
        }
        let response = self.extended(START_TLS_OID, None).await?;
        debug!(name = ?response.response_name, "StartTLS accepted, beginning handshake");
        let connector = connector_for(&self.settings)?;
        let name = tls::server_name(&self.host).map_err(setup_error)?;
        self.transport.upgrade_tls(connector, name).await
    }

    /// Generic extended operation. Returns the full response on
    /// success; any non-success result code is an error.
    pub async fn extended(
        &self,
        request_name: &str,
        request_value: Option<Vec<u8>>,
    ) -> Result<ExtendedResponse> {
        let request = self.session.extended_request(request_name, request_value)?;
        let message = self.transact(request).await?;
        let ProtocolOp::ExtendedResponse(response) = message.protocol_op else {
            return Err(LdapError::Malformed(format!(
                "unexpected response to extended operation: {:?}",
                message.protocol_op
            )));
        };
        match response.result.result_code {
            ResultCode::Success => Ok(response),
            code => Err(LdapError::OperationFailed {
                code,
                matched_dn: response.result.matched_dn.clone(),
                message: response.result.diagnostics_message.clone(),
            }),
        }
    }

    /// RFC 4532 WhoAmI. Returns the server's authorization id, e.g.
    /// "u:EXAMPLE\\jdoe" or "dn:cn=jdoe,dc=example,dc=com".
    pub async fn whoami(&self) -> Result<String> {
        let response = self.extended(WHOAMI_OID, None).await?;
        let authz_id = response.response_value.unwrap_or_default();
        String::from_utf8(authz_id)
            .map_err(|_| LdapError::Malformed("non-UTF-8 authorization id".to_string()))
    }

    /// Start a search; entries are pulled from the returned stream.
    pub async fn search(&self, options: &SearchOptions, filter: &str) -> Result<SearchStream> {
        self.search_with_controls(options, Filter::parse(filter)?, None)
            .await
    }

    pub async fn search_with_controls(
        &self,
        options: &SearchOptions,
        filter: Filter,
        controls: Option<Vec<crate::protocol::Control>>,
    ) -> Result<SearchStream> {
        let request = self.session.search_request(options, filter, controls)?;
        let message_id = request.message_id;
        self.dispatcher.register(message_id)?;
        if let Err(err) = self.transport.send(request.bytes).await {
            self.dispatcher.remove(message_id);
            return Err(err);
        }
        Ok(SearchStream::new(
            self.dispatcher.clone(),
            message_id,
            self.operation_timeout,
            self.cancel.clone(),
        ))
    }

    /// Cookie-driven pagination over a large result set.
    pub fn paged_search(&self, options: SearchOptions, filter: Filter) -> crate::search::SearchPaginator<'_> {
        crate::search::SearchPaginator::new(self, options, filter)
    }

    /// Send an unbind if the session is still open, then close the
    /// socket. Consumes the connection; unbind has no response.
    pub async fn close(self) {
        if self.session.state() != ConnectionState::Closed {
            if let Ok(request) = self.session.unbind_request() {
                let _ = self.transport.send(request.bytes).await;
            }
        }
        self.transport.shutdown().await;
        self.cancel.cancel();
    }
}

fn connector_for(settings: &ConnectionSettings) -> Result<TlsConnector> {
    let config = tls::client_config(settings.tls_skip_verify(), settings.tls_ca_file())
        .map_err(setup_error)?;
    Ok(TlsConnector::from(config))
}
