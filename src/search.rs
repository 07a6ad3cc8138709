// Search result consumption: a pull-based stream over one search's
// responses, entry conversion, and the RFC 2696 paged-results control
// used for cookie-based pagination.

use crate::dispatcher::RequestDispatcher;
use crate::error::{LdapError, Result};
use crate::protocol::{
    BerReader, BerWriter, Control, PartialAttribute, ProtocolOp, ResultCode, SearchResultEntry,
    PAGED_RESULTS_OID,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Decoded value of the paged-results control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResultsValue {
    pub size: i32,
    pub cookie: Vec<u8>,
}

/// Build the request-side control: SEQUENCE { size, cookie }.
pub fn paged_results_control(page_size: i32, cookie: &[u8]) -> Control {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(page_size);
    writer.write_octet_string(cookie);
    writer.end_sequence(seq);
    Control {
        control_type: PAGED_RESULTS_OID.to_string(),
        // RFC 2696 sends the control non-critical; DEFAULT FALSE means
        // the criticality BOOLEAN is omitted on the wire
        criticality: false,
        value: Some(writer.into_vec()),
    }
}

/// Find and decode the paged-results control among a response's
/// controls, if present.
pub fn decode_paged_results(controls: Option<&[Control]>) -> Result<Option<PagedResultsValue>> {
    let Some(control) = controls
        .unwrap_or(&[])
        .iter()
        .find(|c| c.control_type == PAGED_RESULTS_OID)
    else {
        return Ok(None);
    };
    let value = control.value.as_deref().ok_or_else(|| {
        LdapError::Malformed("paged results control without a value".to_string())
    })?;
    let mut reader = BerReader::new(value);
    let _end = reader.read_sequence()?;
    let size = reader.read_integer()?;
    let cookie = reader.read_octet_string()?;
    Ok(Some(PagedResultsValue { size, cookie }))
}

/// One directory entry, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Vec<PartialAttribute>,
}

impl SearchEntry {
    /// First value of the named attribute as UTF-8, if any. Attribute
    /// names compare case-insensitively, as LDAP requires.
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .and_then(|a| a.values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All raw values of the named attribute.
    pub fn raw_values(&self, name: &str) -> &[Vec<u8>] {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.values.as_slice())
            .unwrap_or(&[])
    }
}

impl From<SearchResultEntry> for SearchEntry {
    fn from(entry: SearchResultEntry) -> Self {
        SearchEntry {
            dn: entry.object_name,
            attributes: entry.attributes,
        }
    }
}

/// Pull-based consumer for one search operation. Entries arrive one at
/// a time; references are logged and skipped; the terminal
/// SearchResultDone decides success or error. Dropping the stream
/// releases the dispatcher queue so stragglers are discarded.
pub struct SearchStream {
    dispatcher: Arc<RequestDispatcher>,
    message_id: i32,
    timeout: Duration,
    cancel: CancellationToken,
    finished: bool,
    done_controls: Option<Vec<Control>>,
    done_result: Option<ResultCode>,
}

impl SearchStream {
    pub(crate) fn new(
        dispatcher: Arc<RequestDispatcher>,
        message_id: i32,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            message_id,
            timeout,
            cancel,
            finished: false,
            done_controls: None,
            done_result: None,
        }
    }

    /// Next entry, or Ok(None) once the search completed. A server-side
    /// size limit ends the stream without error; referral results and
    /// other non-success codes are errors.
    pub async fn next_entry(&mut self) -> Result<Option<SearchEntry>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let message = match self
                .dispatcher
                .wait_for_message(self.message_id, self.timeout, &self.cancel)
                .await
            {
                Ok(message) => message,
                Err(err) => {
                    self.finish();
                    return Err(err);
                }
            };
            match message.protocol_op {
                ProtocolOp::SearchResultEntry(entry) => return Ok(Some(entry.into())),
                ProtocolOp::SearchResultReference(uris) => {
                    debug!(message_id = self.message_id, ?uris, "skipping continuation reference");
                }
                ProtocolOp::SearchResultDone(done) => {
                    self.finish();
                    self.done_controls = message.controls;
                    self.done_result = Some(done.result.result_code);
                    return match done.result.result_code {
                        ResultCode::Success => Ok(None),
                        ResultCode::SizeLimitExceeded => {
                            warn!(
                                message_id = self.message_id,
                                "search truncated by server size limit"
                            );
                            Ok(None)
                        }
                        ResultCode::Referral => Err(LdapError::Referral(
                            done.result.referrals.unwrap_or_default(),
                        )),
                        code => Err(LdapError::OperationFailed {
                            code,
                            matched_dn: done.result.matched_dn,
                            message: done.result.diagnostics_message,
                        }),
                    };
                }
                other => {
                    self.finish();
                    return Err(LdapError::Malformed(format!(
                        "unexpected response to search: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Collect every remaining entry.
    pub async fn collect(&mut self) -> Result<Vec<SearchEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Response controls from the terminal SearchResultDone. Only
    /// populated after the stream finished cleanly.
    pub fn done_controls(&self) -> Option<&[Control]> {
        self.done_controls.as_deref()
    }

    /// Result code of the terminal SearchResultDone, once seen.
    /// Distinguishes a clean Success end from a size-limit truncation.
    pub fn done_result(&self) -> Option<ResultCode> {
        self.done_result
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.dispatcher.remove(self.message_id);
        }
    }
}

impl Drop for SearchStream {
    fn drop(&mut self) {
        // abandoned mid-search: release the queue so late messages
        // for this id are dropped on arrival
        if !self.finished {
            self.dispatcher.remove(self.message_id);
        }
    }
}

/// Walks a large result set page by page using the paged-results
/// cookie. The page size comes from the search's size limit when set,
/// otherwise 1000 entries per page.
pub struct SearchPaginator<'a> {
    connection: &'a crate::connection::LdapConnection,
    options: crate::session::SearchOptions,
    filter: crate::filter::Filter,
    page_size: i32,
    cookie: Vec<u8>,
    finished: bool,
}

const DEFAULT_PAGE_SIZE: i32 = 1000;

impl<'a> SearchPaginator<'a> {
    pub(crate) fn new(
        connection: &'a crate::connection::LdapConnection,
        options: crate::session::SearchOptions,
        filter: crate::filter::Filter,
    ) -> Self {
        let page_size = if options.size_limit > 0 {
            options.size_limit
        } else {
            DEFAULT_PAGE_SIZE
        };
        Self {
            connection,
            options,
            filter,
            page_size,
            cookie: Vec::new(),
            finished: false,
        }
    }

    /// Fetch the next page. Ok(None) once the server's cookie runs
    /// out. A server that returns no paged-results control gave the
    /// whole result in one response.
    pub async fn next_page(&mut self) -> Result<Option<Vec<SearchEntry>>> {
        if self.finished {
            return Ok(None);
        }
        let control = paged_results_control(self.page_size, &self.cookie);
        let mut stream = self
            .connection
            .search_with_controls(&self.options, self.filter.clone(), Some(vec![control]))
            .await?;
        let entries = stream.collect().await?;
        if stream.done_result() == Some(ResultCode::SizeLimitExceeded) {
            // partial results; the cookie, if any, is not worth chasing
            self.finished = true;
            return Ok(Some(entries));
        }
        match decode_paged_results(stream.done_controls())? {
            Some(value) if !value.cookie.is_empty() => {
                debug!(cookie_len = value.cookie.len(), "more pages remain");
                self.cookie = value.cookie;
            }
            _ => {
                self.finished = true;
            }
        }
        Ok(Some(entries))
    }

    /// Drain every remaining page into one vector.
    pub async fn collect_all(&mut self) -> Result<Vec<SearchEntry>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
