// End-to-end scenarios against a scripted in-process LDAP server. The
// server side reuses the crate's own codec to decode requests and
// hand-build responses.

use bytes::BytesMut;
use ldap_engine::protocol::{
    self, BindResponse, Control, ExtendedResponse, LdapMessage, LdapResult, PartialAttribute,
    ProtocolOp, ResultCode, SearchResultDone, SearchResultEntry,
};
use ldap_engine::search::{decode_paged_results, paged_results_control};
use ldap_engine::session::extract_message;
use ldap_engine::{
    ConnectionSettings, ConnectionState, LdapConnection, LdapError, SearchOptions, SecurityContext,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ldap_engine=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn read_request(stream: &mut TcpStream, buffer: &mut BytesMut) -> Option<LdapMessage> {
    loop {
        if let Some(message) = extract_message(buffer).expect("well-formed request") {
            return Some(message);
        }
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

async fn send(stream: &mut TcpStream, message: &LdapMessage) {
    let bytes = protocol::encode_ldap_message(message).expect("encodable response");
    stream.write_all(&bytes).await.expect("write response");
}

fn bind_success(message_id: i32) -> LdapMessage {
    LdapMessage {
        message_id,
        protocol_op: ProtocolOp::BindResponse(BindResponse {
            result: LdapResult::success(),
            server_sasl_creds: None,
        }),
        controls: None,
    }
}

fn entry(message_id: i32, dn: &str) -> LdapMessage {
    LdapMessage {
        message_id,
        protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: dn.to_string(),
            attributes: vec![PartialAttribute {
                name: "objectClass".to_string(),
                values: vec![b"user".to_vec()],
            }],
        }),
        controls: None,
    }
}

fn search_done(message_id: i32, controls: Option<Vec<Control>>) -> LdapMessage {
    LdapMessage {
        message_id,
        protocol_op: ProtocolOp::SearchResultDone(SearchResultDone {
            result: LdapResult::success(),
        }),
        controls,
    }
}

async fn start_server<F, Fut>(script: F) -> String
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        script(stream).await;
    });
    format!("ldap://{}", addr)
}

#[tokio::test]
async fn bind_search_whoami_unbind() {
    init_logging();
    let url = start_server(|mut stream| async move {
        let mut buffer = BytesMut::new();

        let bind = read_request(&mut stream, &mut buffer).await.expect("bind");
        assert!(matches!(bind.protocol_op, ProtocolOp::BindRequest(_)));
        send(&mut stream, &bind_success(bind.message_id)).await;

        let search = read_request(&mut stream, &mut buffer).await.expect("search");
        let ProtocolOp::SearchRequest(req) = &search.protocol_op else {
            panic!("expected search request");
        };
        assert_eq!(req.base_object, "dc=example,dc=com");
        assert_eq!(req.attributes, vec!["cn".to_string()]);
        send(&mut stream, &entry(search.message_id, "cn=a,dc=example,dc=com")).await;
        send(&mut stream, &entry(search.message_id, "cn=b,dc=example,dc=com")).await;
        send(&mut stream, &search_done(search.message_id, None)).await;

        let whoami = read_request(&mut stream, &mut buffer).await.expect("whoami");
        let ProtocolOp::ExtendedRequest(req) = &whoami.protocol_op else {
            panic!("expected extended request");
        };
        assert_eq!(req.request_name, protocol::WHOAMI_OID);
        send(
            &mut stream,
            &LdapMessage {
                message_id: whoami.message_id,
                protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult::success(),
                    response_name: None,
                    response_value: Some(b"u:EXAMPLE\\svc".to_vec()),
                }),
                controls: None,
            },
        )
        .await;

        let unbind = read_request(&mut stream, &mut buffer).await.expect("unbind");
        assert!(matches!(unbind.protocol_op, ProtocolOp::UnbindRequest));
    })
    .await;

    let conn = LdapConnection::connect(ConnectionSettings::new(url))
        .await
        .expect("connect");
    conn.simple_bind("cn=svc,dc=example,dc=com", "secret")
        .await
        .expect("bind");
    assert_eq!(conn.state(), ConnectionState::Bound);

    let options = SearchOptions::subtree("dc=example,dc=com").attributes(&["cn"]);
    let mut stream = conn
        .search(&options, "(objectClass=user)")
        .await
        .expect("search");
    let entries = stream.collect().await.expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].dn, "cn=a,dc=example,dc=com");
    assert_eq!(entries[1].first_str("objectclass"), Some("user"));

    assert_eq!(conn.whoami().await.expect("whoami"), "u:EXAMPLE\\svc");
    conn.close().await;
}

#[tokio::test]
async fn paged_search_walks_all_cookies() {
    init_logging();
    // Three pages; the server hands back cookies "c1", "c2", then an
    // empty cookie to finish.
    let pages: Vec<(Vec<&str>, &[u8])> = vec![
        (vec!["cn=a,dc=t", "cn=b,dc=t"], b"c1"),
        (vec!["cn=c,dc=t", "cn=d,dc=t"], b"c2"),
        (vec!["cn=e,dc=t"], b""),
    ];
    let url = start_server(move |mut stream| async move {
        let mut buffer = BytesMut::new();
        let mut expected_cookie: Vec<u8> = Vec::new();
        for (dns, next_cookie) in pages {
            let search = read_request(&mut stream, &mut buffer).await.expect("search");
            let paged = decode_paged_results(search.controls.as_deref())
                .expect("decodable control")
                .expect("paged control present");
            assert_eq!(paged.size, 2);
            assert_eq!(paged.cookie, expected_cookie);
            for dn in dns {
                send(&mut stream, &entry(search.message_id, dn)).await;
            }
            send(
                &mut stream,
                &search_done(
                    search.message_id,
                    Some(vec![paged_results_control(0, next_cookie)]),
                ),
            )
            .await;
            expected_cookie = next_cookie.to_vec();
        }
        // unbind from close()
        let _ = read_request(&mut stream, &mut buffer).await;
    })
    .await;

    let conn = LdapConnection::connect(ConnectionSettings::new(url))
        .await
        .expect("connect");
    let mut options = SearchOptions::subtree("dc=t");
    options.size_limit = 2;
    let mut paginator = conn.paged_search(options, ldap_engine::Filter::parse("(cn=*)").unwrap());

    let first = paginator.next_page().await.expect("page 1").expect("some");
    assert_eq!(first.len(), 2);
    let rest = paginator.collect_all().await.expect("remaining pages");
    assert_eq!(rest.len(), 3);
    assert_eq!(rest.last().map(|e| e.dn.as_str()), Some("cn=e,dc=t"));
    assert!(paginator.next_page().await.expect("after end").is_none());
    conn.close().await;
}

#[tokio::test]
async fn paginator_stops_on_truncated_results() {
    init_logging();
    // SizeLimitExceeded means the results are partial; a cookie on the
    // done must not trigger another page request.
    let url = start_server(|mut stream| async move {
        let mut buffer = BytesMut::new();
        let search = read_request(&mut stream, &mut buffer).await.expect("search");
        send(&mut stream, &entry(search.message_id, "cn=a,dc=t")).await;
        send(
            &mut stream,
            &LdapMessage {
                message_id: search.message_id,
                protocol_op: ProtocolOp::SearchResultDone(SearchResultDone {
                    result: LdapResult {
                        result_code: ResultCode::SizeLimitExceeded,
                        matched_dn: String::new(),
                        diagnostics_message: "size limit exceeded".to_string(),
                        referrals: None,
                    },
                }),
                controls: Some(vec![paged_results_control(0, b"more")]),
            },
        )
        .await;
        // the only traffic after the truncated page is the unbind
        let next = read_request(&mut stream, &mut buffer).await.expect("unbind");
        assert!(
            matches!(next.protocol_op, ProtocolOp::UnbindRequest),
            "unexpected request after truncated page: {:?}",
            next.protocol_op
        );
    })
    .await;

    let conn = LdapConnection::connect(ConnectionSettings::new(url))
        .await
        .expect("connect");
    let mut paginator = conn.paged_search(
        SearchOptions::subtree("dc=t"),
        ldap_engine::Filter::parse("(cn=*)").unwrap(),
    );
    let page = paginator.next_page().await.expect("page").expect("entries");
    assert_eq!(page.len(), 1);
    assert!(paginator.next_page().await.expect("after truncation").is_none());
    conn.close().await;
}

struct XorLayer;

impl SecurityContext for XorLayer {
    fn wrap(&self, plaintext: &[u8], _confidential: bool) -> ldap_engine::Result<Vec<u8>> {
        Ok(plaintext.iter().map(|b| b ^ 0x5C).collect())
    }

    fn unwrap(&self, wrapped: &[u8]) -> ldap_engine::Result<Vec<u8>> {
        Ok(wrapped.iter().map(|b| b ^ 0x5C).collect())
    }
}

async fn read_wrapped_request(stream: &mut TcpStream) -> LdapMessage {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.expect("frame length");
    let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut frame).await.expect("frame body");
    let pdu: Vec<u8> = frame.iter().map(|b| b ^ 0x5C).collect();
    let (message, _) = protocol::decode_ldap_message(&pdu).expect("wrapped request");
    message
}

async fn send_wrapped(stream: &mut TcpStream, message: &LdapMessage) {
    let pdu = protocol::encode_ldap_message(message).expect("encodable response");
    let wrapped: Vec<u8> = pdu.iter().map(|b| b ^ 0x5C).collect();
    let mut frame = (wrapped.len() as u32).to_be_bytes().to_vec();
    frame.extend(wrapped);
    stream.write_all(&frame).await.expect("write wrapped");
}

#[tokio::test]
async fn security_layer_wraps_both_directions() {
    init_logging();
    let url = start_server(|mut stream| async move {
        let mut buffer = BytesMut::new();

        // the bind itself travels in the clear
        let bind = read_request(&mut stream, &mut buffer).await.expect("bind");
        let ProtocolOp::BindRequest(req) = &bind.protocol_op else {
            panic!("expected bind request");
        };
        assert!(matches!(
            &req.authentication,
            ldap_engine::protocol::BindAuthentication::Sasl { mechanism, .. }
                if mechanism == "TOY"
        ));
        send(&mut stream, &bind_success(bind.message_id)).await;

        // everything after the layer install arrives length-framed and
        // wrapped, and responses must be wrapped the same way
        let whoami = read_wrapped_request(&mut stream).await;
        let ProtocolOp::ExtendedRequest(req) = &whoami.protocol_op else {
            panic!("expected extended request");
        };
        assert_eq!(req.request_name, protocol::WHOAMI_OID);
        send_wrapped(
            &mut stream,
            &LdapMessage {
                message_id: whoami.message_id,
                protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult::success(),
                    response_name: None,
                    response_value: Some(b"dn:cn=svc,dc=t".to_vec()),
                }),
                controls: None,
            },
        )
        .await;

        let unbind = read_wrapped_request(&mut stream).await;
        assert!(matches!(unbind.protocol_op, ProtocolOp::UnbindRequest));
    })
    .await;

    let conn = LdapConnection::connect(ConnectionSettings::new(url))
        .await
        .expect("connect");
    let outcome = conn
        .sasl_bind_step("cn=svc,dc=t", "TOY", Some(b"token".to_vec()))
        .await
        .expect("sasl bind");
    assert!(matches!(
        outcome,
        ldap_engine::SaslBindOutcome::Complete { .. }
    ));
    conn.install_security_layer(Box::new(XorLayer), false)
        .await
        .expect("install layer");

    assert_eq!(conn.whoami().await.expect("whoami"), "dn:cn=svc,dc=t");
    conn.close().await;
}

#[tokio::test]
async fn notice_of_disconnection_fails_in_flight_search() {
    init_logging();
    let url = start_server(|mut stream| async move {
        let mut buffer = BytesMut::new();
        let search = read_request(&mut stream, &mut buffer).await.expect("search");
        send(&mut stream, &entry(search.message_id, "cn=a,dc=t")).await;
        // unsolicited termination notice instead of more results
        send(
            &mut stream,
            &LdapMessage {
                message_id: 0,
                protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult {
                        result_code: ResultCode::Unavailable,
                        matched_dn: String::new(),
                        diagnostics_message: "maintenance".to_string(),
                        referrals: None,
                    },
                    response_name: Some(protocol::NOTICE_OF_DISCONNECTION_OID.to_string()),
                    response_value: None,
                }),
                controls: None,
            },
        )
        .await;
    })
    .await;

    let conn = LdapConnection::connect(ConnectionSettings::new(url))
        .await
        .expect("connect");
    let mut stream = conn
        .search(&SearchOptions::subtree("dc=t"), "(cn=*)")
        .await
        .expect("search");

    let first = stream.next_entry().await.expect("first entry");
    assert_eq!(first.map(|e| e.dn), Some("cn=a,dc=t".to_string()));
    let err = stream.next_entry().await.expect_err("disconnected");
    assert_eq!(
        err,
        LdapError::Disconnected {
            code: ResultCode::Unavailable,
            message: "maintenance".to_string(),
        }
    );

    // the whole connection is dead, not just this search
    let err = conn.whoami().await.expect_err("connection failed");
    assert!(matches!(err, LdapError::Disconnected { .. }));
}

#[tokio::test]
async fn server_result_codes_surface_as_operation_errors() {
    init_logging();
    let url = start_server(|mut stream| async move {
        let mut buffer = BytesMut::new();
        let bind = read_request(&mut stream, &mut buffer).await.expect("bind");
        send(
            &mut stream,
            &LdapMessage {
                message_id: bind.message_id,
                protocol_op: ProtocolOp::BindResponse(BindResponse {
                    result: LdapResult {
                        result_code: ResultCode::InvalidCredentials,
                        matched_dn: String::new(),
                        diagnostics_message: "80090308: LdapErr: DSID-0C09041C".to_string(),
                        referrals: None,
                    },
                    server_sasl_creds: None,
                }),
                controls: None,
            },
        )
        .await;
        let _ = read_request(&mut stream, &mut buffer).await;
    })
    .await;

    let conn = LdapConnection::connect(ConnectionSettings::new(url))
        .await
        .expect("connect");
    let err = conn
        .simple_bind("cn=svc,dc=t", "wrong")
        .await
        .expect_err("bad credentials");
    match err {
        LdapError::OperationFailed { code, message, .. } => {
            assert_eq!(code, ResultCode::InvalidCredentials);
            assert!(message.contains("80090308"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    // a failed bind leaves the connection usable
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.close().await;
}
