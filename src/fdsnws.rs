use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthInfo};
use crate::domain::LineItem;
use crate::error::WavereqError;
use crate::http;
use crate::router::{self, RouteGroup, RouteParam, RoutingClient};
use crate::store::{BlobStore, PersistedRequest};

/// Per-line download result, also derived from stored blobs on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    NoData,
    Error,
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineStatus::Ok => write!(f, "OK"),
            LineStatus::NoData => write!(f, "NODATA"),
            LineStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Receives per-line status and progress while an engine runs.
pub trait StatusSink: Send + Sync {
    fn line(&self, request_id: u64, param: &RouteParam, status: LineStatus, detail: &str);
    fn progress(&self, request_id: u64, done: usize, total: usize);
}

/// Default sink: everything goes to the log.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn line(&self, request_id: u64, param: &RouteParam, status: LineStatus, detail: &str) {
        if detail.is_empty() {
            info!("request {request_id}: {} {status}", param.request_line());
        } else {
            info!(
                "request {request_id}: {} {status} ({detail})",
                param.request_line()
            );
        }
    }

    fn progress(&self, request_id: u64, done: usize, total: usize) {
        debug!("request {request_id}: {done}/{total} time windows");
    }
}

/// One fetch against a data center.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 2xx with a body.
    Data(Vec<u8>),
    /// 2xx with an empty body (incl. 204): the window holds no data.
    NoData,
    /// 401: the endpoint wants credentials.
    Unauthorized,
    /// Any other status; the message is recorded against the line.
    Failed(String),
}

pub trait DataClient: Send + Sync {
    /// Per-line GET against a query endpoint, with optional basic-auth
    /// credentials.
    fn fetch_line(
        &self,
        url: &str,
        param: &RouteParam,
        cred: Option<(&str, &str)>,
    ) -> Result<FetchOutcome, WavereqError>;

    /// Bulk POST of a complete plain-text request document.
    fn fetch_bulk(&self, url: &str, body: &str) -> Result<FetchOutcome, WavereqError>;

    /// Exchange the auth token for short-lived `user:pass` credentials.
    /// `Ok(None)` means the data center does not support authentication.
    fn auth_handshake(&self, query_url: &str, token: &str)
    -> Result<Option<String>, WavereqError>;
}

pub struct HttpDataClient {
    client: Client,
}

impl HttpDataClient {
    pub fn new() -> Result<Self, WavereqError> {
        Ok(Self {
            client: http::build_client()?,
        })
    }

    fn outcome(response: reqwest::blocking::Response) -> Result<FetchOutcome, WavereqError> {
        let status = response.status();
        if status.as_u16() == 401 {
            return Ok(FetchOutcome::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            let message = if message.trim().is_empty() {
                status.to_string()
            } else {
                message
            };
            return Ok(FetchOutcome::Failed(message));
        }
        let bytes = response
            .bytes()
            .map_err(|err| WavereqError::DataHttp(err.to_string()))?;
        if bytes.is_empty() {
            Ok(FetchOutcome::NoData)
        } else {
            Ok(FetchOutcome::Data(bytes.to_vec()))
        }
    }
}

impl DataClient for HttpDataClient {
    fn fetch_line(
        &self,
        url: &str,
        param: &RouteParam,
        cred: Option<(&str, &str)>,
    ) -> Result<FetchOutcome, WavereqError> {
        let response = http::send_with_retries(
            || {
                let mut request = self.client.get(url).query(&param.query_pairs());
                if let Some((user, pass)) = cred {
                    request = request.basic_auth(user, Some(pass));
                }
                request
            },
            WavereqError::DataHttp,
        )?;
        Self::outcome(response)
    }

    fn fetch_bulk(&self, url: &str, body: &str) -> Result<FetchOutcome, WavereqError> {
        let response = http::send_with_retries(
            || {
                self.client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(body.to_string())
            },
            WavereqError::DataHttp,
        )?;
        Self::outcome(response)
    }

    fn auth_handshake(
        &self,
        query_url: &str,
        token: &str,
    ) -> Result<Option<String>, WavereqError> {
        // Probe the service description first; data centers without an auth
        // resource get anonymous requests.
        let wadl_url = with_endpoint(query_url, "application.wadl");
        let response =
            http::send_with_retries(|| self.client.get(&wadl_url), WavereqError::DataHttp)?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let wadl = response
            .text()
            .map_err(|err| WavereqError::DataHttp(err.to_string()))?;
        if !wadl.contains("path=\"auth\"") {
            info!("{wadl_url}: authentication is not supported");
            return Ok(None);
        }

        // Token exchange always goes over TLS.
        let auth_url = force_https(&with_endpoint(query_url, "auth"));
        let response = http::send_with_retries(
            || {
                self.client
                    .post(&auth_url)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(token.to_string())
            },
            WavereqError::DataHttp,
        )?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::AuthFailed(format!(
                "{auth_url}: status {status}: {message}"
            )));
        }
        let cred = response
            .text()
            .map_err(|err| WavereqError::DataHttp(err.to_string()))?;
        Ok(Some(cred.trim().to_string()))
    }
}

/// Replace the trailing `query` segment of an endpoint URL.
fn with_endpoint(query_url: &str, endpoint: &str) -> String {
    match query_url.strip_suffix("query") {
        Some(base) => format!("{base}{endpoint}"),
        None => query_url.to_string(),
    }
}

fn force_https(url: &str) -> String {
    match url.strip_prefix("http:") {
        Some(rest) => format!("https:{rest}"),
        None => url.to_string(),
    }
}

/// Derive a per-part filename by appending `_<i>` before the extension.
fn part_filename(filename: &str, index: usize) -> String {
    match filename.rfind('.') {
        Some(dot) => format!("{}_{index}{}", &filename[..dot], &filename[dot..]),
        None => format!("{filename}_{index}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
}

/// Drives the fetches of one route group. Lines whose blob already exists
/// are reported from the store without touching the network, which makes
/// re-running after an interruption idempotent.
struct DownloadEngine<'c> {
    request_id: u64,
    group: &'c RouteGroup,
    options: &'c BTreeMap<String, String>,
    bulk: bool,
    token: Option<String>,
    cred: Option<String>,
    auth_attempted: bool,
}

impl<'c> DownloadEngine<'c> {
    fn new(
        request_id: u64,
        group: &'c RouteGroup,
        options: &'c BTreeMap<String, String>,
        bulk: bool,
        token: Option<String>,
    ) -> Self {
        Self {
            request_id,
            group,
            options,
            bulk,
            token,
            cred: None,
            auth_attempted: false,
        }
    }

    fn run(
        &mut self,
        data: &dyn DataClient,
        store: &BlobStore,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, WavereqError> {
        if self.bulk {
            self.run_bulk(data, store, sink, stop)
        } else {
            self.run_lines(data, store, sink, stop)
        }
    }

    fn run_bulk(
        &mut self,
        data: &dyn DataClient,
        store: &BlobStore,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, WavereqError> {
        let blob_id = require_blob_id(self.group.blob_id)?;

        if stop.load(Ordering::Relaxed) {
            return Ok(RunOutcome::Stopped);
        }

        if let Some(blob) = store.get_blob(blob_id)? {
            self.report_bulk(sink, blob_status(&blob), "");
            sink.progress(self.request_id, self.group.params.len(), self.group.params.len());
            return Ok(RunOutcome::Completed);
        }

        let mut body = router::options_prefix(self.options);
        for param in &self.group.params {
            body.push_str(&param.request_line());
            body.push('\n');
        }

        match data.fetch_bulk(&self.group.url, &body)? {
            FetchOutcome::Data(bytes) => {
                self.report_bulk(sink, LineStatus::Ok, "");
                store.put_blob(blob_id, &bytes)?;
            }
            FetchOutcome::NoData => {
                self.report_bulk(sink, LineStatus::NoData, "");
                store.put_blob(blob_id, &[])?;
            }
            FetchOutcome::Unauthorized => {
                self.report_bulk(sink, LineStatus::Error, "authentication required");
            }
            FetchOutcome::Failed(message) => {
                self.report_bulk(sink, LineStatus::Error, &message);
            }
        }

        sink.progress(self.request_id, self.group.params.len(), self.group.params.len());
        Ok(RunOutcome::Completed)
    }

    fn run_lines(
        &mut self,
        data: &dyn DataClient,
        store: &BlobStore,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, WavereqError> {
        let total = self.group.params.len();

        for (done, param) in self.group.params.iter().enumerate() {
            if stop.load(Ordering::Relaxed) {
                return Ok(RunOutcome::Stopped);
            }
            sink.progress(self.request_id, done, total);

            let blob_id = require_blob_id(param.blob_id)?;
            if let Some(blob) = store.get_blob(blob_id)? {
                sink.line(self.request_id, param, blob_status(&blob), "");
                continue;
            }

            // A failed line is recorded and the engine moves on; only
            // transport-level errors from the retry layer abort the run.
            match self.fetch_with_auth(data, param)? {
                FetchOutcome::Data(bytes) => {
                    sink.line(
                        self.request_id,
                        param,
                        LineStatus::Ok,
                        &format!("{} bytes", bytes.len()),
                    );
                    store.put_blob(blob_id, &bytes)?;
                }
                FetchOutcome::NoData => {
                    sink.line(self.request_id, param, LineStatus::NoData, "");
                    store.put_blob(blob_id, &[])?;
                }
                FetchOutcome::Unauthorized => {
                    sink.line(
                        self.request_id,
                        param,
                        LineStatus::Error,
                        "authentication failed",
                    );
                }
                FetchOutcome::Failed(message) => {
                    sink.line(self.request_id, param, LineStatus::Error, &message);
                }
            }
        }

        sink.progress(self.request_id, total, total);
        Ok(RunOutcome::Completed)
    }

    /// Fetch one line, performing the auth handshake at most once per group.
    /// When the handshake fails or the center does not support it, the token
    /// is dropped for this group and the request degrades to anonymous.
    fn fetch_with_auth(
        &mut self,
        data: &dyn DataClient,
        param: &RouteParam,
    ) -> Result<FetchOutcome, WavereqError> {
        if self.token.is_some() && self.cred.is_none() && !self.auth_attempted {
            self.handshake(data);
        }

        let outcome = self.send_line(data, param)?;
        if !matches!(outcome, FetchOutcome::Unauthorized) {
            return Ok(outcome);
        }

        if self.token.is_some() && !self.auth_attempted {
            self.handshake(data);
            if self.cred.is_some() {
                return self.send_line(data, param);
            }
        }

        Ok(FetchOutcome::Unauthorized)
    }

    fn send_line(
        &self,
        data: &dyn DataClient,
        param: &RouteParam,
    ) -> Result<FetchOutcome, WavereqError> {
        match self.cred.as_deref().and_then(|cred| cred.split_once(':')) {
            Some((user, pass)) => {
                let url = with_endpoint(&self.group.url, "queryauth");
                data.fetch_line(&url, param, Some((user, pass)))
            }
            None => data.fetch_line(&self.group.url, param, None),
        }
    }

    fn handshake(&mut self, data: &dyn DataClient) {
        self.auth_attempted = true;
        let Some(token) = self.token.as_deref() else {
            return;
        };
        match data.auth_handshake(&self.group.url, token) {
            Ok(Some(cred)) => self.cred = Some(cred),
            Ok(None) => self.token = None,
            Err(err) => {
                warn!("{}: {err}", self.group.url);
                self.token = None;
            }
        }
    }

    fn report_bulk(&self, sink: &dyn StatusSink, status: LineStatus, detail: &str) {
        for param in &self.group.params {
            sink.line(self.request_id, param, status, detail);
        }
    }
}

fn blob_status(blob: &[u8]) -> LineStatus {
    if blob.is_empty() {
        LineStatus::NoData
    } else {
        LineStatus::Ok
    }
}

fn require_blob_id(blob_id: Option<u64>) -> Result<u64, WavereqError> {
    blob_id.ok_or_else(|| WavereqError::Storage("route group has no blob id".to_string()))
}

/// A persisted request with its download engines: creates blob placeholders
/// and the durable record, runs the groups and assembles the final product.
pub struct RequestAggregator {
    record: PersistedRequest,
    token: Option<String>,
}

impl RequestAggregator {
    /// Persist a new request: reserve a blob key per group and per line, then
    /// add the record. Keys exist before any fetch so a crash between create
    /// and run leaves a cleanly resumable record.
    pub fn create(
        store: &BlobStore,
        mut record: PersistedRequest,
        token: Option<String>,
    ) -> Result<Self, WavereqError> {
        for group in &mut record.groups {
            group.blob_id = Some(store.reserve_blob()?);
            for param in &mut group.params {
                param.blob_id = Some(store.reserve_blob()?);
            }
        }
        let id = store.add_request(&mut record)?;
        debug!("created request {id} with {} route groups", record.groups.len());
        Ok(Self { record, token })
    }

    /// Attach to an already-persisted record (resume path).
    pub fn load(record: PersistedRequest, token: Option<String>) -> Self {
        Self { record, token }
    }

    pub fn id(&self) -> Result<u64, WavereqError> {
        self.record
            .id
            .ok_or_else(|| WavereqError::Storage("request record has no id".to_string()))
    }

    pub fn record(&self) -> &PersistedRequest {
        &self.record
    }

    /// Run every route group. Completion is a simple finished-count over the
    /// groups; a stop request ends the run at the next item boundary.
    pub fn run(
        &self,
        data: &dyn DataClient,
        store: &BlobStore,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, WavereqError> {
        let id = self.id()?;
        let total = self.record.groups.len();
        let mut finished = 0usize;

        for group in &self.record.groups {
            let mut engine = DownloadEngine::new(
                id,
                group,
                &self.record.options,
                self.record.bulk,
                self.token.clone(),
            );
            match engine.run(data, store, sink, stop)? {
                RunOutcome::Completed => finished += 1,
                RunOutcome::Stopped => {
                    info!("request {id}: stopped after {finished}/{total} route groups");
                    return Ok(RunOutcome::Stopped);
                }
            }
        }

        debug!("request {id}: {finished}/{total} route groups finished");
        Ok(RunOutcome::Completed)
    }

    fn group_product(
        group: &RouteGroup,
        bulk: bool,
        store: &BlobStore,
    ) -> Result<Vec<u8>, WavereqError> {
        if bulk {
            let blob_id = require_blob_id(group.blob_id)?;
            return Ok(store.get_blob(blob_id)?.unwrap_or_default());
        }
        let mut product = Vec::new();
        for param in &group.params {
            let blob_id = require_blob_id(param.blob_id)?;
            if let Some(blob) = store.get_blob(blob_id)? {
                product.extend_from_slice(&blob);
            }
        }
        Ok(product)
    }

    /// Final artifacts: one merged file, or one file per route group with an
    /// indexed filename. Empty products are skipped.
    pub fn products(&self, store: &BlobStore) -> Result<Vec<(String, Vec<u8>)>, WavereqError> {
        if self.record.merge {
            let mut merged = Vec::new();
            for group in &self.record.groups {
                merged.extend_from_slice(&Self::group_product(group, self.record.bulk, store)?);
            }
            if merged.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![(self.record.filename.clone(), merged)]);
        }

        let mut products = Vec::new();
        for (i, group) in self.record.groups.iter().enumerate() {
            let product = Self::group_product(group, self.record.bulk, store)?;
            if !product.is_empty() {
                products.push((part_filename(&self.record.filename, i), product));
            }
        }
        Ok(products)
    }

    /// Delete all payloads of the request, then the record itself, in that
    /// order so an interrupted purge never leaves an id-less record behind.
    pub fn purge(store: &BlobStore, record: &PersistedRequest) -> Result<(), WavereqError> {
        for group in &record.groups {
            if let Some(blob_id) = group.blob_id {
                store.delete_blob(blob_id)?;
            }
            for param in &group.params {
                if let Some(blob_id) = param.blob_id {
                    store.delete_blob(blob_id)?;
                }
            }
        }
        if let Some(id) = record.id {
            store.delete_request(id)?;
        }
        Ok(())
    }
}

/// What the request controller hands over after the review step.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub service: String,
    pub options: BTreeMap<String, String>,
    pub bulk: bool,
    pub merge: bool,
    pub content_type: String,
    pub filename: String,
    pub timewindows: Vec<LineItem>,
}

/// Front door of the download side: routes a submission, persists it and
/// drives its engines. Without a store, submissions are rejected and only
/// the auth token (held in memory) keeps working.
pub struct FdsnwsControl<D: DataClient, R: RoutingClient> {
    data: D,
    routing_client: R,
    routing: bool,
    router_url: String,
    fdsnws_root: String,
    store: Option<BlobStore>,
    token: Option<String>,
    auth_info: Option<AuthInfo>,
}

impl<D: DataClient, R: RoutingClient> FdsnwsControl<D, R> {
    pub fn new(
        data: D,
        routing_client: R,
        routing: bool,
        router_url: String,
        fdsnws_root: String,
        store: Option<BlobStore>,
    ) -> Self {
        Self {
            data,
            routing_client,
            routing,
            router_url,
            fdsnws_root,
            store,
            token: None,
            auth_info: None,
        }
    }

    pub fn store(&self) -> Result<&BlobStore, WavereqError> {
        self.store.as_ref().ok_or(WavereqError::StoreDisabled)
    }

    /// Load the stored auth token and re-drive every persisted request.
    /// Returns the ids that were resumed.
    pub fn init(
        &mut self,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<Vec<u64>, WavereqError> {
        self.load_auth_token()?;

        let Some(store) = self.store.as_ref() else {
            warn!("offline storage unavailable; requests will not be persisted");
            return Ok(Vec::new());
        };

        let mut resumed = Vec::new();
        for record in store.list_requests()? {
            let aggregator = RequestAggregator::load(record, self.token.clone());
            let id = aggregator.id()?;
            info!("resuming request {id}");
            aggregator.run(&self.data, store, sink, stop)?;
            resumed.push(id);
        }
        Ok(resumed)
    }

    /// Activate a previously stored token, dropping it if it no longer
    /// parses.
    pub fn load_auth_token(&mut self) -> Result<Option<AuthInfo>, WavereqError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(None);
        };
        let Some(token) = store.get_token()? else {
            return Ok(None);
        };
        match auth::parse_token(&token) {
            Ok(info) => {
                self.auth_info = Some(info.clone());
                self.token = Some(token);
                Ok(Some(info))
            }
            Err(err) => {
                warn!("dropping stored auth token: {err}");
                store.delete_token()?;
                Ok(None)
            }
        }
    }

    /// Store and activate a token, or clear it with `None`.
    pub fn set_auth_token(
        &mut self,
        token: Option<&str>,
    ) -> Result<Option<AuthInfo>, WavereqError> {
        match token {
            None => {
                if let Some(store) = self.store.as_ref() {
                    store.delete_token()?;
                }
                self.token = None;
                self.auth_info = None;
                Ok(None)
            }
            Some(token) => {
                let info = auth::parse_token(token)?;
                if let Some(store) = self.store.as_ref() {
                    store.put_token(token)?;
                }
                self.token = Some(token.to_string());
                self.auth_info = Some(info.clone());
                Ok(Some(info))
            }
        }
    }

    pub fn auth_info(&self) -> Option<&AuthInfo> {
        self.auth_info.as_ref()
    }

    /// Route, persist and run a new request. Direct mode forces a merged
    /// product since everything comes from a single data center anyway.
    pub fn submit_request(
        &self,
        params: SubmitParams,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<u64, WavereqError> {
        let store = self.store()?;

        let (groups, merge) = if self.routing {
            let groups = router::resolve_routes(
                &self.routing_client,
                &self.router_url,
                &params.service,
                &params.timewindows,
            )?;
            (groups, params.merge)
        } else {
            let groups =
                router::direct_routes(&self.fdsnws_root, &params.service, &params.timewindows);
            (groups, true)
        };

        let record = PersistedRequest {
            id: None,
            service: params.service,
            groups,
            options: params.options,
            bulk: params.bulk,
            merge,
            content_type: params.content_type,
            filename: params.filename,
        };

        let aggregator = RequestAggregator::create(store, record, self.token.clone())?;
        let id = aggregator.id()?;
        aggregator.run(&self.data, store, sink, stop)?;
        Ok(id)
    }

    pub fn list(&self) -> Result<Vec<PersistedRequest>, WavereqError> {
        self.store()?.list_requests()
    }

    /// Re-drive a persisted request; lines with stored payloads are not
    /// fetched again.
    pub fn resume(
        &self,
        id: u64,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, WavereqError> {
        let store = self.store()?;
        let record = store
            .get_request(id)?
            .ok_or(WavereqError::RequestNotFound(id))?;
        let aggregator = RequestAggregator::load(record, self.token.clone());
        aggregator.run(&self.data, store, sink, stop)
    }

    /// Idempotent: purging an id with no record left is a no-op.
    pub fn purge(&self, id: u64) -> Result<(), WavereqError> {
        let store = self.store()?;
        match store.get_request(id)? {
            Some(record) => RequestAggregator::purge(store, &record),
            None => Ok(()),
        }
    }

    /// Assembled artifacts of a finished request.
    pub fn products(&self, id: u64) -> Result<Vec<(String, Vec<u8>)>, WavereqError> {
        let store = self.store()?;
        let record = store
            .get_request(id)?
            .ok_or(WavereqError::RequestNotFound(id))?;
        RequestAggregator::load(record, None).products(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_substitution() {
        assert_eq!(
            with_endpoint("http://dc.example/fdsnws/dataselect/1/query", "queryauth"),
            "http://dc.example/fdsnws/dataselect/1/queryauth"
        );
        assert_eq!(
            force_https(&with_endpoint("http://dc.example/fdsnws/dataselect/1/query", "auth")),
            "https://dc.example/fdsnws/dataselect/1/auth"
        );
        // Unexpected endpoint shapes are left alone.
        assert_eq!(with_endpoint("http://dc.example/other", "auth"), "http://dc.example/other");
    }

    #[test]
    fn part_filenames() {
        assert_eq!(part_filename("Package_7.mseed", 0), "Package_7_0.mseed");
        assert_eq!(part_filename("archive.tar.gz", 2), "archive.tar_2.gz");
        assert_eq!(part_filename("noext", 1), "noext_1");
    }

    #[test]
    fn blob_status_from_length() {
        assert_eq!(blob_status(b""), LineStatus::NoData);
        assert_eq!(blob_status(b"x"), LineStatus::Ok);
    }
}
