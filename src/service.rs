use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::domain::{
    EVENT_HEADER, EventBatch, EventLine, EventRow, LineItem, NetworkClass, Restriction,
    STATION_HEADER, StationBatch, StationLine, StationRow, StreamCode,
};
use crate::error::WavereqError;
use crate::http;

pub const SIZE_EXCEEDED_MESSAGE: &str = "maximum request size exceeded";

/// Station search constraints for `metadata/query`. Absent fields are left
/// out of the form entirely.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StationQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networktype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensortype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferredsps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streams: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minlat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxlat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minlon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxlon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minradius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxradius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minazimuth: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxazimuth: Option<f64>,
    /// JSON-encoded event list for event-relative station searches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<String>,
}

/// Event search constraints for `event/<catalog>`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minmag: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxmag: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mindepth: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxdepth: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minlat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxlat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minlon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxlon: Option<f64>,
}

/// How the time-window service should derive window bounds: fixed absolute
/// bounds, or phase onset times relative to each selected event.
#[derive(Debug, Clone)]
pub enum TimeWindowSpec {
    Absolute {
        start: String,
        end: String,
    },
    Relative {
        events: Vec<EventLine>,
        start_phase: String,
        start_offset: i64,
        end_phase: String,
        end_offset: i64,
    },
}

pub trait MetadataClient: Send + Sync {
    /// Station search. A 204 response means no matches, not an error.
    fn query_stations(&self, query: &StationQuery)
    -> Result<Option<StationBatch>, WavereqError>;

    /// Event search against a named catalog. 204 means no matches.
    fn query_events(
        &self,
        catalog: &str,
        query: &EventQuery,
    ) -> Result<Option<EventBatch>, WavereqError>;

    /// Parse a caller-supplied event listing (e.g. CSV) server side into the
    /// same batch shape as a catalog query. 204 means nothing was parseable.
    fn parse_events(
        &self,
        format: &str,
        columns: &str,
        input: &str,
    ) -> Result<Option<EventBatch>, WavereqError>;

    /// Phase names supported by the relative time-window mode.
    fn phases(&self) -> Result<Vec<String>, WavereqError>;

    /// Expand stream selections into concrete sized time windows.
    fn timewindows(
        &self,
        streams: &[StationLine],
        spec: &TimeWindowSpec,
    ) -> Result<Vec<LineItem>, WavereqError>;
}

pub struct MetadataHttpClient {
    client: Client,
    service_root: String,
}

impl MetadataHttpClient {
    /// `service_root` must carry a trailing slash (see `Settings::service_root`).
    pub fn new(service_root: String) -> Result<Self, WavereqError> {
        Ok(Self {
            client: http::build_client()?,
            service_root,
        })
    }

    fn fetch_batch(
        &self,
        url: &str,
        form: &impl Serialize,
    ) -> Result<Option<Value>, WavereqError> {
        let response = http::send_with_retries(
            || self.client.post(url).form(form),
            WavereqError::MetadataHttp,
        )?;

        let status = response.status();
        if status.as_u16() == 204 {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::MetadataStatus {
                status: status.as_u16(),
                message,
            });
        }

        let value = response
            .json()
            .map_err(|err| WavereqError::MetadataHttp(err.to_string()))?;
        Ok(Some(value))
    }
}

impl MetadataClient for MetadataHttpClient {
    fn query_stations(
        &self,
        query: &StationQuery,
    ) -> Result<Option<StationBatch>, WavereqError> {
        let url = format!("{}metadata/query", self.service_root);
        self.fetch_batch(&url, query)?
            .map(|value| parse_station_batch(&value))
            .transpose()
    }

    fn query_events(
        &self,
        catalog: &str,
        query: &EventQuery,
    ) -> Result<Option<EventBatch>, WavereqError> {
        let url = format!("{}event/{catalog}", self.service_root);
        let response = http::send_with_retries(
            || self.client.get(&url).query(query),
            WavereqError::MetadataHttp,
        )?;

        let status = response.status();
        if status.as_u16() == 204 {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::MetadataStatus {
                status: status.as_u16(),
                message,
            });
        }

        let value: Value = response
            .json()
            .map_err(|err| WavereqError::MetadataHttp(err.to_string()))?;
        parse_event_batch(&value).map(Some)
    }

    fn parse_events(
        &self,
        format: &str,
        columns: &str,
        input: &str,
    ) -> Result<Option<EventBatch>, WavereqError> {
        let url = format!("{}event/parse", self.service_root);
        let form = [("informat", format), ("columns", columns), ("input", input)];
        self.fetch_batch(&url, &form)?
            .map(|value| parse_event_batch(&value))
            .transpose()
    }

    fn phases(&self) -> Result<Vec<String>, WavereqError> {
        let url = format!("{}metadata/phases", self.service_root);
        let response =
            http::send_with_retries(|| self.client.get(&url), WavereqError::MetadataHttp)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::MetadataStatus {
                status: status.as_u16(),
                message,
            });
        }

        let value: Value = response
            .json()
            .map_err(|err| WavereqError::MetadataHttp(err.to_string()))?;
        parse_phases(&value)
    }

    fn timewindows(
        &self,
        streams: &[StationLine],
        spec: &TimeWindowSpec,
    ) -> Result<Vec<LineItem>, WavereqError> {
        let url = format!("{}metadata/timewindows", self.service_root);
        let form = timewindow_form(streams, spec);
        info!("fetching the list of time windows");

        let response = http::send_with_retries(
            || self.client.post(&url).form(&form),
            WavereqError::MetadataHttp,
        )?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::MetadataStatus {
                status: status.as_u16(),
                message,
            });
        }

        let value: Value = response
            .json()
            .map_err(|err| WavereqError::MetadataHttp(err.to_string()))?;
        parse_timewindows(&value)
    }
}

fn timewindow_form(streams: &[StationLine], spec: &TimeWindowSpec) -> Vec<(String, String)> {
    let streams_json =
        Value::Array(streams.iter().map(StationLine::to_value).collect()).to_string();
    let mut form = vec![("streams".to_string(), streams_json)];

    match spec {
        TimeWindowSpec::Absolute { start, end } => {
            form.push(("start".to_string(), start.clone()));
            form.push(("end".to_string(), end.clone()));
        }
        TimeWindowSpec::Relative {
            events,
            start_phase,
            start_offset,
            end_phase,
            end_offset,
        } => {
            let events_json =
                Value::Array(events.iter().map(EventLine::to_value).collect()).to_string();
            form.push(("events".to_string(), events_json));
            form.push(("startphase".to_string(), start_phase.clone()));
            form.push(("startoffset".to_string(), start_offset.to_string()));
            form.push(("endphase".to_string(), end_phase.clone()));
            form.push(("endoffset".to_string(), end_offset.to_string()));
        }
    }

    form
}

pub fn parse_timewindows(value: &Value) -> Result<Vec<LineItem>, WavereqError> {
    value
        .as_array()
        .ok_or_else(|| malformed("timewindow", "expected an array"))?
        .iter()
        .map(LineItem::from_value)
        .collect()
}

fn parse_phases(value: &Value) -> Result<Vec<String>, WavereqError> {
    let rows = value
        .as_array()
        .ok_or_else(|| malformed("phases", "expected an array"))?;
    let mut phases = Vec::with_capacity(rows.len());
    for row in rows {
        // Either bare names or [name, label] pairs.
        let name = match row {
            Value::String(name) => name.clone(),
            Value::Array(pair) => pair
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("phases", "empty phase entry"))?
                .to_string(),
            _ => return Err(malformed("phases", "unexpected phase entry")),
        };
        phases.push(name);
    }
    Ok(phases)
}

/// Parse the positional station result: a header row of column names followed
/// by data rows in the same column order.
pub fn parse_station_batch(value: &Value) -> Result<StationBatch, WavereqError> {
    let (header, rows) = split_batch("station", value)?;

    let mut parsed = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row
            .as_array()
            .ok_or_else(|| malformed("station", "row is not an array"))?;
        if row.len() < STATION_HEADER.len() {
            return Err(malformed("station", "row has too few columns"));
        }

        let streams = row[9]
            .as_array()
            .ok_or_else(|| malformed("station", "streams column is not an array"))?
            .iter()
            .map(|code| {
                code.as_str()
                    .ok_or_else(|| malformed("station", "stream code is not a string"))?
                    .parse::<StreamCode>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let stream_restrictions = row[10]
            .as_array()
            .ok_or_else(|| malformed("station", "streams_restricted column is not an array"))?
            .iter()
            .map(|flag| {
                flag.as_u64()
                    .map(|flag| Restriction(flag as u8))
                    .ok_or_else(|| malformed("station", "stream restriction is not an integer"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        parsed.push(StationRow {
            key: text("station", &row[0])?,
            network: text("station", &row[1])?,
            station: text("station", &row[2])?,
            latitude: number("station", &row[3])?,
            longitude: number("station", &row[4])?,
            restriction: Restriction(
                row[5]
                    .as_u64()
                    .ok_or_else(|| malformed("station", "restricted is not an integer"))?
                    as u8,
            ),
            net_class: text("station", &row[6])?.parse::<NetworkClass>()?,
            archive: text("station", &row[7])?,
            operator: text("station", &row[8])?,
            streams,
            stream_restrictions,
            filtered_streams: Vec::new(),
            selected: false,
        });
    }

    Ok(StationBatch {
        header,
        rows: parsed,
    })
}

/// Parse the positional event result. A magnitude of `--` or null means the
/// catalog has none for that event.
pub fn parse_event_batch(value: &Value) -> Result<EventBatch, WavereqError> {
    let (header, rows) = split_batch("event", value)?;

    let mut parsed = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row
            .as_array()
            .ok_or_else(|| malformed("event", "row is not an array"))?;
        if row.len() < EVENT_HEADER.len() {
            return Err(malformed("event", "row has too few columns"));
        }

        let magnitude = match &row[1] {
            Value::Null => None,
            Value::String(s) if s == "--" => None,
            other => Some(number("event", other)?),
        };

        parsed.push(EventRow {
            datetime: text("event", &row[0])?,
            magnitude,
            magnitude_type: text("event", &row[2])?,
            latitude: number("event", &row[3])?,
            longitude: number("event", &row[4])?,
            depth_km: number("event", &row[5])?,
            key: text("event", &row[6])?,
            region: text("event", &row[7])?,
            selected: false,
        });
    }

    Ok(EventBatch {
        header,
        rows: parsed,
    })
}

fn split_batch<'a>(
    kind: &'static str,
    value: &'a Value,
) -> Result<(Vec<String>, &'a [Value]), WavereqError> {
    let rows = value
        .as_array()
        .ok_or_else(|| malformed(kind, "expected an array"))?;
    let (header, rows) = rows
        .split_first()
        .ok_or_else(|| malformed(kind, "missing header row"))?;
    let header = header
        .as_array()
        .ok_or_else(|| malformed(kind, "header is not an array"))?
        .iter()
        .map(|name| {
            name.as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed(kind, "header entry is not a string"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((header, rows))
}

fn text(kind: &'static str, value: &Value) -> Result<String, WavereqError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| malformed(kind, "expected a string column"))
}

fn number(kind: &'static str, value: &Value) -> Result<f64, WavereqError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| malformed(kind, "numeric column out of range")),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| malformed(kind, "numeric column is not parseable")),
        _ => Err(malformed(kind, "expected a numeric column")),
    }
}

fn malformed(kind: &'static str, message: &str) -> WavereqError {
    WavereqError::MalformedBatch {
        kind,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn station_batch_round_trip() {
        let value = json!([
            ["key", "netcode", "statcode", "latitude", "longitude", "restricted",
             "netclass", "archive", "netoperator", "streams", "streams_restricted"],
            ["GE-APE", "GE", "APE", 37.07, 25.52, 0, "p", "GFZ", "GEOFON",
             [".BHZ", "00.LHZ"], [2, 1]]
        ]);
        let batch = parse_station_batch(&value).unwrap();
        assert_eq!(batch.header.len(), STATION_HEADER.len());
        assert_eq!(batch.rows.len(), 1);
        let row = &batch.rows[0];
        assert_eq!(row.network, "GE");
        assert_eq!(row.streams.len(), 2);
        assert_eq!(row.streams[1].location, "00");
        assert!(row.stream_restrictions[1].is_restricted());
        assert!(!row.selected);
    }

    #[test]
    fn event_magnitude_placeholder_maps_to_none() {
        let value = json!([
            ["datetime", "magnitude", "magtype", "latitude", "longitude", "depth", "key", "region"],
            ["2020-05-02 12:00:00", "--", "M", 35.0, 25.0, 10.0, "evt-1", "Crete"],
            ["2020-05-03 12:00:00", 4.7, "Mw", 35.1, 25.1, 12.0, "evt-2", "Crete"]
        ]);
        let batch = parse_event_batch(&value).unwrap();
        assert_eq!(batch.rows[0].magnitude, None);
        assert_eq!(batch.rows[1].magnitude, Some(4.7));
    }

    #[test]
    fn short_row_is_rejected() {
        let value = json!([
            ["datetime", "magnitude", "magtype", "latitude", "longitude", "depth", "key", "region"],
            ["2020-05-02 12:00:00", 4.0]
        ]);
        assert_matches!(
            parse_event_batch(&value),
            Err(WavereqError::MalformedBatch { kind: "event", .. })
        );
    }

    #[test]
    fn timewindow_rows_parse_to_line_items() {
        let value = json!([
            ["2020-01-01T00:00:00Z", "2020-01-02T00:00:00Z", "GE", "APE", "BHZ", "", 4096]
        ]);
        let items = parse_timewindows(&value).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].size, Some(4096));
        assert_eq!(items[0].location_or_dashes(), "--");
    }

    #[test]
    fn relative_form_carries_phase_fields() {
        let spec = TimeWindowSpec::Relative {
            events: vec![EventLine {
                latitude: 35.0,
                longitude: 25.0,
                depth_km: 10.0,
                time: "2020-05-02T12:00:00.000Z".to_string(),
            }],
            start_phase: "P".to_string(),
            start_offset: -2,
            end_phase: "S".to_string(),
            end_offset: 10,
        };
        let form = timewindow_form(&[], &spec);
        let keys: Vec<_> = form.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(
            keys,
            ["streams", "events", "startphase", "startoffset", "endphase", "endoffset"]
        );
        assert_eq!(form[3].1, "-2");
    }
}
