use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::{EventLine, LineItem, RequestKind};
use crate::error::WavereqError;
use crate::http;

/// Submission for the legacy request service, which does its own routing
/// and delivers archives out of band.
#[derive(Debug, Clone)]
pub struct LegacySubmission {
    pub user: String,
    pub kind: RequestKind,
    pub compressed: bool,
    pub response_dictionary: bool,
    pub timewindows: Vec<LineItem>,
    pub event_info: Vec<EventLine>,
}

/// One accepted per-data-center request ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTicket {
    pub dcid: String,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct LegacyOutcome {
    pub tickets: Vec<LegacyTicket>,
    /// Lines the service could not route to any data center.
    pub failed_lines: usize,
}

/// How an existing request group is re-driven: retry the failed lines,
/// reroute them, or resend everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubmitMode {
    Retry,
    Reroute,
    Resend,
}

impl ResubmitMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResubmitMode::Retry => "retry",
            ResubmitMode::Reroute => "reroute",
            ResubmitMode::Resend => "resend",
        }
    }
}

pub trait LegacyClient: Send + Sync {
    fn submit(&self, submission: &LegacySubmission) -> Result<LegacyOutcome, WavereqError>;
    fn status(
        &self,
        server: &str,
        user: &str,
        request_id: &str,
        start: usize,
        count: usize,
    ) -> Result<Value, WavereqError>;
    fn purge(&self, server: &str, user: &str, request_id: &str) -> Result<(), WavereqError>;
    /// Re-drive the listed (dcid, request id) pairs of a request group.
    fn resubmit(
        &self,
        user: &str,
        uuid: &str,
        mode: ResubmitMode,
        id_list: &[(String, String)],
    ) -> Result<LegacyOutcome, WavereqError>;
    /// Fetch a finished volume from the request service.
    fn download(
        &self,
        server: &str,
        user: &str,
        request_id: &str,
        volume: Option<&str>,
    ) -> Result<Vec<u8>, WavereqError>;
}

pub struct LegacyHttpClient {
    client: Client,
    service_root: String,
}

impl LegacyHttpClient {
    pub fn new(service_root: String) -> Result<Self, WavereqError> {
        Ok(Self {
            client: http::build_client()?,
            service_root,
        })
    }
}

impl LegacyClient for LegacyHttpClient {
    fn submit(&self, submission: &LegacySubmission) -> Result<LegacyOutcome, WavereqError> {
        let url = format!("{}request/submit", self.service_root);
        let timewindows =
            Value::Array(submission.timewindows.iter().map(LineItem::to_value).collect())
                .to_string();
        let eventinfo =
            Value::Array(submission.event_info.iter().map(EventLine::to_value).collect())
                .to_string();
        let form = [
            ("user", submission.user.clone()),
            ("requesttype", legacy_type_name(submission.kind)?.to_string()),
            ("compressed", submission.compressed.to_string()),
            (
                "responsedictionary",
                submission.response_dictionary.to_string(),
            ),
            ("timewindows", timewindows),
            ("eventinfo", eventinfo),
        ];

        let response = http::send_with_retries(
            || self.client.post(&url).form(&form),
            WavereqError::LegacyHttp,
        )?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::LegacyStatus {
                status: status.as_u16(),
                message,
            });
        }
        let value: Value = response
            .json()
            .map_err(|err| WavereqError::LegacyHttp(err.to_string()))?;
        let outcome = parse_submit_outcome(&value)?;

        info!(
            "sent {} legacy request{}",
            outcome.tickets.len(),
            if outcome.tickets.len() == 1 { "" } else { "s" }
        );
        if outcome.failed_lines > 0 {
            warn!("routing of {} lines failed", outcome.failed_lines);
        }
        Ok(outcome)
    }

    fn status(
        &self,
        server: &str,
        user: &str,
        request_id: &str,
        start: usize,
        count: usize,
    ) -> Result<Value, WavereqError> {
        let url = format!("{}request/status", self.service_root);
        let response = http::send_with_retries(
            || {
                self.client.get(&url).query(&[
                    ("server", server),
                    ("user", user),
                    ("request", request_id),
                    ("start", &start.to_string()),
                    ("count", &count.to_string()),
                ])
            },
            WavereqError::LegacyHttp,
        )?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::LegacyStatus {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .map_err(|err| WavereqError::LegacyHttp(err.to_string()))
    }

    fn resubmit(
        &self,
        user: &str,
        uuid: &str,
        mode: ResubmitMode,
        id_list: &[(String, String)],
    ) -> Result<LegacyOutcome, WavereqError> {
        let url = format!("{}request/resubmit", self.service_root);
        let form = [
            ("user", user.to_string()),
            ("uuid", uuid.to_string()),
            ("mode", mode.as_str().to_string()),
            ("idlist", id_list_json(id_list)),
        ];

        let response = http::send_with_retries(
            || self.client.post(&url).form(&form),
            WavereqError::LegacyHttp,
        )?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::LegacyStatus {
                status: status.as_u16(),
                message,
            });
        }
        let value: Value = response
            .json()
            .map_err(|err| WavereqError::LegacyHttp(err.to_string()))?;
        parse_submit_outcome(&value)
    }

    fn download(
        &self,
        server: &str,
        user: &str,
        request_id: &str,
        volume: Option<&str>,
    ) -> Result<Vec<u8>, WavereqError> {
        let url = format!("{}request/download", self.service_root);
        let mut query = vec![
            ("server", server),
            ("user", user),
            ("request", request_id),
        ];
        if let Some(volume) = volume {
            query.push(("volume", volume));
        }

        let response = http::send_with_retries(
            || self.client.get(&url).query(&query),
            WavereqError::LegacyHttp,
        )?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::LegacyStatus {
                status: status.as_u16(),
                message,
            });
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| WavereqError::LegacyHttp(err.to_string()))
    }

    fn purge(&self, server: &str, user: &str, request_id: &str) -> Result<(), WavereqError> {
        let url = format!("{}request/purge", self.service_root);
        let response = http::send_with_retries(
            || {
                self.client.get(&url).query(&[
                    ("server", server),
                    ("user", user),
                    ("request", request_id),
                ])
            },
            WavereqError::LegacyHttp,
        )?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::LegacyStatus {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// The resubmit id list goes out as a JSON array of [dcid, id] pairs.
fn id_list_json(id_list: &[(String, String)]) -> String {
    Value::Array(
        id_list
            .iter()
            .map(|(dcid, id)| serde_json::json!([dcid, id]))
            .collect(),
    )
    .to_string()
}

fn legacy_type_name(kind: RequestKind) -> Result<&'static str, WavereqError> {
    match kind {
        RequestKind::LegacyMseed => Ok("MSEED"),
        RequestKind::LegacyFseed => Ok("FSEED"),
        RequestKind::LegacyInventory => Ok("INVENTORY"),
        other => Err(WavereqError::LegacyHttp(format!(
            "{other:?} is not a legacy request type"
        ))),
    }
}

/// The submit response lists accepted tickets under `success` and unroutable
/// entries under `failure`, each carrying the lines that failed.
pub fn parse_submit_outcome(value: &Value) -> Result<LegacyOutcome, WavereqError> {
    let success = value
        .get("success")
        .and_then(Value::as_array)
        .ok_or_else(|| WavereqError::LegacyHttp("missing success list".to_string()))?;

    let mut tickets = Vec::with_capacity(success.len());
    for entry in success {
        let dcid = entry
            .get("dcid")
            .and_then(Value::as_str)
            .ok_or_else(|| WavereqError::LegacyHttp("ticket without dcid".to_string()))?;
        let id = match entry.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(WavereqError::LegacyHttp("ticket without id".to_string())),
        };
        tickets.push(LegacyTicket {
            dcid: dcid.to_string(),
            id,
        });
    }

    let failed_lines = value
        .get("failure")
        .and_then(Value::as_array)
        .map(|failures| {
            failures
                .iter()
                .filter_map(|entry| entry.get("line").and_then(Value::as_array))
                .map(Vec::len)
                .sum()
        })
        .unwrap_or(0);

    Ok(LegacyOutcome {
        tickets,
        failed_lines,
    })
}
