use std::fs;
use std::sync::atomic::AtomicBool;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::auth::AuthInfo;
use crate::error::WavereqError;
use crate::fdsnws::{DataClient, FdsnwsControl, RunOutcome, StatusSink, SubmitParams};
use crate::legacy::{LegacyClient, LegacyOutcome, LegacySubmission};
use crate::request::{
    Confirmer, RequestController, ReviewHook, SubmitInfo, SubmitOutcome, SubmitSink,
};
use crate::router::RoutingClient;
use crate::service::{EventQuery, MetadataClient, StationQuery};
use crate::settings::Settings;

/// One persisted request with its stored progress.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub id: u64,
    pub service: String,
    pub filename: String,
    pub bulk: bool,
    pub merge: bool,
    pub groups: usize,
    pub lines: usize,
    pub fetched: usize,
    pub nodata: usize,
}

/// Wires the selection side (controller + metadata service) to the delivery
/// side (FDSNWS downloads, legacy request service).
pub struct App<M: MetadataClient, D: DataClient, R: RoutingClient, L: LegacyClient> {
    controller: RequestController,
    metadata: M,
    fdsnws: FdsnwsControl<D, R>,
    legacy: L,
}

impl<M: MetadataClient, D: DataClient, R: RoutingClient, L: LegacyClient> App<M, D, R, L> {
    pub fn new(settings: Settings, metadata: M, fdsnws: FdsnwsControl<D, R>, legacy: L) -> Self {
        Self {
            controller: RequestController::new(settings),
            metadata,
            fdsnws,
            legacy,
        }
    }

    /// Restore the auth token and resume persisted requests.
    pub fn init(
        &mut self,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<Vec<u64>, WavereqError> {
        self.fdsnws.init(sink, stop)
    }

    pub fn controller(&self) -> &RequestController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut RequestController {
        &mut self.controller
    }

    /// Run a station search and append the result to the current pack.
    /// Returns the number of appended rows; zero means an empty result.
    pub fn load_stations(&mut self, query: &StationQuery) -> Result<usize, WavereqError> {
        match self.metadata.query_stations(query)? {
            Some(batch) => {
                let count = batch.rows.len();
                self.controller.append_stations(&batch);
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// Run an event search against a catalog and append the result.
    pub fn load_events(
        &mut self,
        catalog: &str,
        query: &EventQuery,
    ) -> Result<usize, WavereqError> {
        match self.metadata.query_events(catalog, query)? {
            Some(batch) => {
                let count = batch.rows.len();
                self.controller.append_events(&batch)?;
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// Parse a caller-supplied event listing server side and append it.
    pub fn import_events(
        &mut self,
        format: &str,
        columns: &str,
        input: &str,
    ) -> Result<usize, WavereqError> {
        match self.metadata.parse_events(format, columns, input)? {
            Some(batch) => {
                let count = batch.rows.len();
                self.controller.append_events(&batch)?;
                Ok(count)
            }
            None => Ok(0),
        }
    }

    pub fn submit(
        &self,
        info: &SubmitInfo,
        review: Option<&dyn ReviewHook>,
        confirmer: &dyn Confirmer,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<SubmitOutcome, WavereqError> {
        let dispatch = SubmitDispatch {
            fdsnws: &self.fdsnws,
            legacy: &self.legacy,
            sink,
            stop,
        };
        self.controller
            .submit(info, &self.metadata, review, confirmer, &dispatch)
    }

    pub fn status(&self) -> Result<Vec<RequestSummary>, WavereqError> {
        let store = self.fdsnws.store()?;
        let mut summaries = Vec::new();

        for record in store.list_requests()? {
            let Some(id) = record.id else { continue };
            let mut lines = 0usize;
            let mut fetched = 0usize;
            let mut nodata = 0usize;

            for group in &record.groups {
                if record.bulk {
                    lines += group.params.len();
                    let len = group
                        .blob_id
                        .map(|id| store.blob_len(id))
                        .transpose()?
                        .flatten();
                    if let Some(len) = len {
                        fetched += group.params.len();
                        if len == 0 {
                            nodata += group.params.len();
                        }
                    }
                    continue;
                }
                for param in &group.params {
                    lines += 1;
                    let len = param
                        .blob_id
                        .map(|id| store.blob_len(id))
                        .transpose()?
                        .flatten();
                    if let Some(len) = len {
                        fetched += 1;
                        if len == 0 {
                            nodata += 1;
                        }
                    }
                }
            }

            summaries.push(RequestSummary {
                id,
                service: record.service.clone(),
                filename: record.filename.clone(),
                bulk: record.bulk,
                merge: record.merge,
                groups: record.groups.len(),
                lines,
                fetched,
                nodata,
            });
        }

        Ok(summaries)
    }

    pub fn resume(
        &self,
        id: u64,
        sink: &dyn StatusSink,
        stop: &AtomicBool,
    ) -> Result<RunOutcome, WavereqError> {
        self.fdsnws.resume(id, sink, stop)
    }

    pub fn purge(&self, id: u64) -> Result<(), WavereqError> {
        self.fdsnws.purge(id)
    }

    /// Write the assembled artifacts of a request into `dir`, returning the
    /// written paths.
    pub fn save(&self, id: u64, dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, WavereqError> {
        let products = self.fdsnws.products(id)?;
        if products.is_empty() {
            return Err(WavereqError::NoDataAvailable);
        }

        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| WavereqError::Filesystem(err.to_string()))?;

        let mut paths = Vec::with_capacity(products.len());
        for (filename, content) in products {
            let path = dir.join(&filename);
            fs::write(path.as_std_path(), &content)
                .map_err(|err| WavereqError::Filesystem(err.to_string()))?;
            info!("wrote {path} ({} bytes)", content.len());
            paths.push(path);
        }
        Ok(paths)
    }

    /// Activate the stored token without re-driving pending requests.
    pub fn load_auth_token(&mut self) -> Result<Option<AuthInfo>, WavereqError> {
        self.fdsnws.load_auth_token()
    }

    pub fn set_auth_token(
        &mut self,
        token: Option<&str>,
    ) -> Result<Option<AuthInfo>, WavereqError> {
        self.fdsnws.set_auth_token(token)
    }

    pub fn auth_info(&self) -> Option<&AuthInfo> {
        self.fdsnws.auth_info()
    }

    pub fn phases(&self) -> Result<Vec<String>, WavereqError> {
        self.metadata.phases()
    }
}

struct SubmitDispatch<'a, D: DataClient, R: RoutingClient, L: LegacyClient> {
    fdsnws: &'a FdsnwsControl<D, R>,
    legacy: &'a L,
    sink: &'a dyn StatusSink,
    stop: &'a AtomicBool,
}

impl<D: DataClient, R: RoutingClient, L: LegacyClient> SubmitSink for SubmitDispatch<'_, D, R, L> {
    fn submit_fdsnws(&self, params: SubmitParams) -> Result<u64, WavereqError> {
        self.fdsnws.submit_request(params, self.sink, self.stop)
    }

    fn submit_legacy(
        &self,
        submission: &LegacySubmission,
    ) -> Result<LegacyOutcome, WavereqError> {
        self.legacy.submit(submission)
    }
}
