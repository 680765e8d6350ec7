use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use wavereq::domain::LineItem;
use wavereq::error::WavereqError;
use wavereq::fdsnws::{
    DataClient, FdsnwsControl, FetchOutcome, LineStatus, RequestAggregator, RunOutcome,
    StatusSink, SubmitParams,
};
use wavereq::router::{RouteGroup, RouteParam, RoutingClient};
use wavereq::store::{BlobStore, PersistedRequest};

#[derive(Default)]
struct MockData {
    /// One entry per fetch: the target URL plus the station code.
    fetched: Mutex<Vec<String>>,
    bulk_bodies: Mutex<Vec<String>>,
    handshakes: Mutex<usize>,
    /// Stations answered with a non-2xx status.
    failing: HashSet<String>,
    /// Stations answered with an empty body.
    empty: HashSet<String>,
    /// Reject anonymous line fetches with 401.
    protected: bool,
    handshake_cred: Option<String>,
    handshake_fails: bool,
    bulk_fails: bool,
    bulk_empty: bool,
}

impl DataClient for MockData {
    fn fetch_line(
        &self,
        url: &str,
        param: &RouteParam,
        cred: Option<(&str, &str)>,
    ) -> Result<FetchOutcome, WavereqError> {
        self.fetched.lock().unwrap().push(format!("{url} {}", param.sta));
        if self.protected && cred.is_none() {
            return Ok(FetchOutcome::Unauthorized);
        }
        if self.failing.contains(&param.sta) {
            return Ok(FetchOutcome::Failed("status 500".to_string()));
        }
        if self.empty.contains(&param.sta) {
            return Ok(FetchOutcome::NoData);
        }
        Ok(FetchOutcome::Data(format!("{};", param.sta).into_bytes()))
    }

    fn fetch_bulk(&self, url: &str, body: &str) -> Result<FetchOutcome, WavereqError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.bulk_bodies.lock().unwrap().push(body.to_string());
        if self.bulk_fails {
            return Ok(FetchOutcome::Failed("status 500".to_string()));
        }
        if self.bulk_empty {
            return Ok(FetchOutcome::NoData);
        }
        Ok(FetchOutcome::Data(b"bulk;".to_vec()))
    }

    fn auth_handshake(
        &self,
        _query_url: &str,
        _token: &str,
    ) -> Result<Option<String>, WavereqError> {
        *self.handshakes.lock().unwrap() += 1;
        if self.handshake_fails {
            return Err(WavereqError::AuthFailed("denied".to_string()));
        }
        Ok(self.handshake_cred.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<(String, LineStatus)>>,
}

impl StatusSink for RecordingSink {
    fn line(&self, _request_id: u64, param: &RouteParam, status: LineStatus, _detail: &str) {
        self.lines.lock().unwrap().push((param.sta.clone(), status));
    }

    fn progress(&self, _request_id: u64, _done: usize, _total: usize) {}
}

struct StaticRouting {
    groups: Option<Vec<RouteGroup>>,
}

impl RoutingClient for StaticRouting {
    fn resolve(
        &self,
        _url: &str,
        _body: &str,
    ) -> Result<Option<Vec<RouteGroup>>, WavereqError> {
        Ok(self.groups.clone())
    }
}

fn temp_store() -> (tempfile::TempDir, BlobStore) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().join("store")).unwrap();
    let store = BlobStore::open(Some(root)).unwrap();
    (dir, store)
}

fn param(sta: &str) -> RouteParam {
    RouteParam {
        net: "GE".to_string(),
        sta: sta.to_string(),
        loc: "--".to_string(),
        cha: "BHZ".to_string(),
        start: "2020-01-01T00:00:00Z".to_string(),
        end: "2020-01-02T00:00:00Z".to_string(),
        priority: None,
        blob_id: None,
    }
}

fn group(url: &str, stations: &[&str]) -> RouteGroup {
    RouteGroup {
        url: url.to_string(),
        params: stations.iter().map(|sta| param(sta)).collect(),
        blob_id: None,
    }
}

fn record(groups: Vec<RouteGroup>, bulk: bool, merge: bool) -> PersistedRequest {
    PersistedRequest {
        id: None,
        service: "dataselect".to_string(),
        groups,
        options: BTreeMap::new(),
        bulk,
        merge,
        content_type: "application/vnd.fdsn.mseed".to_string(),
        filename: "Package_1.mseed".to_string(),
    }
}

fn line_item(sta: &str) -> LineItem {
    LineItem {
        start: "2020-01-01T00:00:00Z".to_string(),
        end: "2020-01-02T00:00:00Z".to_string(),
        network: "GE".to_string(),
        station: sta.to_string(),
        channel: "BHZ".to_string(),
        location: "".to_string(),
        size: Some(4096),
    }
}

const QUERY_URL: &str = "http://dc.example/fdsnws/dataselect/1/query";

#[test]
fn failed_line_is_recorded_and_the_rest_collected() {
    let (_dir, store) = temp_store();
    let data = MockData {
        failing: HashSet::from(["KBU".to_string()]),
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(vec![group(QUERY_URL, &["APE", "KBU", "ANMO"])], false, true);
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    let outcome = aggregator.run(&data, &store, &sink, &stop).unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let lines = sink.lines.lock().unwrap();
    assert_eq!(
        *lines,
        vec![
            ("APE".to_string(), LineStatus::Ok),
            ("KBU".to_string(), LineStatus::Error),
            ("ANMO".to_string(), LineStatus::Ok),
        ]
    );

    // The failed line contributes nothing to the merged product.
    let products = aggregator.products(&store).unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].0, "Package_1.mseed");
    assert_eq!(products[0].1, b"APE;ANMO;");
}

#[test]
fn rerun_fetches_only_missing_payloads() {
    let (_dir, store) = temp_store();
    let data = MockData {
        failing: HashSet::from(["KBU".to_string()]),
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(vec![group(QUERY_URL, &["APE", "KBU", "ANMO"])], false, true);
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();
    let id = aggregator.id().unwrap();

    // Second run against a now-healthy backend: stored payloads are reported
    // from the store, only the failed line hits the network.
    let data = MockData::default();
    let sink = RecordingSink::default();
    let reloaded = RequestAggregator::load(store.get_request(id).unwrap().unwrap(), None);
    reloaded.run(&data, &store, &sink, &stop).unwrap();

    assert_eq!(*data.fetched.lock().unwrap(), vec![format!("{QUERY_URL} KBU")]);
    let lines = sink.lines.lock().unwrap();
    assert_eq!(
        *lines,
        vec![
            ("APE".to_string(), LineStatus::Ok),
            ("KBU".to_string(), LineStatus::Ok),
            ("ANMO".to_string(), LineStatus::Ok),
        ]
    );

    let products = reloaded.products(&store).unwrap();
    assert_eq!(products[0].1, b"APE;KBU;ANMO;");
}

#[test]
fn stop_request_halts_before_the_next_fetch() {
    let (_dir, store) = temp_store();
    let data = MockData::default();
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(true);

    let record = record(vec![group(QUERY_URL, &["APE", "KBU"])], false, true);
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    let outcome = aggregator.run(&data, &store, &sink, &stop).unwrap();

    assert_eq!(outcome, RunOutcome::Stopped);
    assert!(data.fetched.lock().unwrap().is_empty());
    assert!(sink.lines.lock().unwrap().is_empty());
}

#[test]
fn empty_line_payload_is_stored_and_not_refetched() {
    let (_dir, store) = temp_store();
    let data = MockData {
        empty: HashSet::from(["APE".to_string()]),
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(vec![group(QUERY_URL, &["APE"])], false, true);
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();
    assert_eq!(sink.lines.lock().unwrap()[0].1, LineStatus::NoData);

    let sink = RecordingSink::default();
    aggregator.run(&data, &store, &sink, &stop).unwrap();
    assert_eq!(data.fetched.lock().unwrap().len(), 1);
    assert_eq!(sink.lines.lock().unwrap()[0].1, LineStatus::NoData);

    assert!(aggregator.products(&store).unwrap().is_empty());
}

#[test]
fn bulk_request_carries_options_and_constraint_lines() {
    let (_dir, store) = temp_store();
    let data = MockData::default();
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let mut record = record(vec![group(QUERY_URL, &["APE", "KBU"])], true, true);
    record.options = BTreeMap::from([
        ("format".to_string(), "xml".to_string()),
        ("level".to_string(), "station".to_string()),
    ]);
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();

    let bodies = data.bulk_bodies.lock().unwrap();
    assert_eq!(
        bodies[0],
        "format=xml\nlevel=station\n\
         GE APE -- BHZ 2020-01-01T00:00:00Z 2020-01-02T00:00:00Z\n\
         GE KBU -- BHZ 2020-01-01T00:00:00Z 2020-01-02T00:00:00Z\n"
    );
    // Every covered line reports the bulk result.
    assert_eq!(sink.lines.lock().unwrap().len(), 2);
    assert_eq!(aggregator.products(&store).unwrap()[0].1, b"bulk;");
}

#[test]
fn failed_bulk_leaves_no_payload_behind() {
    let (_dir, store) = temp_store();
    let data = MockData {
        bulk_fails: true,
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(vec![group(QUERY_URL, &["APE", "KBU"])], true, true);
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();

    {
        let lines = sink.lines.lock().unwrap();
        assert!(lines.iter().all(|(_, status)| *status == LineStatus::Error));
    }
    assert!(aggregator.products(&store).unwrap().is_empty());

    // No payload was stored, so a rerun goes back to the network.
    aggregator.run(&data, &store, &sink, &stop).unwrap();
    assert_eq!(data.fetched.lock().unwrap().len(), 2);
}

#[test]
fn empty_bulk_response_is_nodata_and_final() {
    let (_dir, store) = temp_store();
    let data = MockData {
        bulk_empty: true,
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(vec![group(QUERY_URL, &["APE"])], true, true);
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();
    assert_eq!(sink.lines.lock().unwrap()[0].1, LineStatus::NoData);

    // The empty blob marks the group as done.
    aggregator.run(&data, &store, &sink, &stop).unwrap();
    assert_eq!(data.fetched.lock().unwrap().len(), 1);
}

#[test]
fn protected_center_gets_credentials_after_the_handshake() {
    let (_dir, store) = temp_store();
    let data = MockData {
        protected: true,
        handshake_cred: Some("someone@example.org:sesame".to_string()),
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(vec![group(QUERY_URL, &["APE", "KBU"])], false, true);
    let aggregator =
        RequestAggregator::create(&store, record, Some("token".to_string())).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();

    assert_eq!(*data.handshakes.lock().unwrap(), 1);
    let fetched = data.fetched.lock().unwrap();
    // Credentialed fetches target the queryauth endpoint.
    let auth_url = "http://dc.example/fdsnws/dataselect/1/queryauth";
    assert_eq!(
        *fetched,
        vec![format!("{auth_url} APE"), format!("{auth_url} KBU")]
    );
    assert!(sink.lines.lock().unwrap().iter().all(|(_, s)| *s == LineStatus::Ok));
}

#[test]
fn failed_handshake_degrades_to_anonymous() {
    let (_dir, store) = temp_store();
    let data = MockData {
        handshake_fails: true,
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(vec![group(QUERY_URL, &["APE", "KBU"])], false, true);
    let aggregator =
        RequestAggregator::create(&store, record, Some("token".to_string())).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();

    // One attempt, then the token is dropped and plain fetches succeed.
    assert_eq!(*data.handshakes.lock().unwrap(), 1);
    assert_eq!(
        *data.fetched.lock().unwrap(),
        vec![format!("{QUERY_URL} APE"), format!("{QUERY_URL} KBU")]
    );
    assert!(sink.lines.lock().unwrap().iter().all(|(_, s)| *s == LineStatus::Ok));
}

#[test]
fn unauthorized_without_token_is_a_line_error() {
    let (_dir, store) = temp_store();
    let data = MockData {
        protected: true,
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(vec![group(QUERY_URL, &["APE"])], false, true);
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();

    assert_eq!(*data.handshakes.lock().unwrap(), 0);
    assert_eq!(sink.lines.lock().unwrap()[0].1, LineStatus::Error);
}

#[test]
fn per_group_products_use_indexed_filenames() {
    let (_dir, store) = temp_store();
    let data = MockData {
        empty: HashSet::from(["KBU".to_string()]),
        ..MockData::default()
    };
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let record = record(
        vec![
            group("http://dc1.example/fdsnws/dataselect/1/query", &["APE"]),
            group("http://dc2.example/fdsnws/dataselect/1/query", &["KBU"]),
            group("http://dc3.example/fdsnws/dataselect/1/query", &["ANMO"]),
        ],
        false,
        false,
    );
    let aggregator = RequestAggregator::create(&store, record, None).unwrap();
    aggregator.run(&data, &store, &sink, &stop).unwrap();

    let products = aggregator.products(&store).unwrap();
    assert_eq!(products.len(), 2);
    assert_eq!(products[0].0, "Package_1_0.mseed");
    assert_eq!(products[0].1, b"APE;");
    assert_eq!(products[1].0, "Package_1_2.mseed");
    assert_eq!(products[1].1, b"ANMO;");
}

fn submit_params() -> SubmitParams {
    SubmitParams {
        service: "dataselect".to_string(),
        options: BTreeMap::new(),
        bulk: false,
        merge: false,
        content_type: "application/vnd.fdsn.mseed".to_string(),
        filename: "Package_1.mseed".to_string(),
        timewindows: vec![line_item("APE")],
    }
}

#[test]
fn empty_routing_result_creates_nothing() {
    let (_dir, store) = temp_store();
    let control = FdsnwsControl::new(
        MockData::default(),
        StaticRouting { groups: None },
        true,
        "http://router.example/routing/1/query".to_string(),
        "/fdsnws".to_string(),
        Some(store.clone()),
    );
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let result = control.submit_request(submit_params(), &sink, &stop);
    assert_matches!(result, Err(WavereqError::NoRoutes));
    assert!(store.list_requests().unwrap().is_empty());
}

#[test]
fn direct_mode_forces_a_merged_product() {
    let (_dir, store) = temp_store();
    let control = FdsnwsControl::new(
        MockData::default(),
        StaticRouting { groups: None },
        false,
        String::new(),
        "http://dc.example/fdsnws".to_string(),
        Some(store.clone()),
    );
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let id = control.submit_request(submit_params(), &sink, &stop).unwrap();
    let record = store.get_request(id).unwrap().unwrap();
    assert!(record.merge);
    assert_eq!(record.groups.len(), 1);
    assert_eq!(
        record.groups[0].url,
        "http://dc.example/fdsnws/dataselect/1/queryauth"
    );

    let products = control.products(id).unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].0, "Package_1.mseed");
}

#[test]
fn submitting_without_a_store_is_rejected() {
    let control = FdsnwsControl::new(
        MockData::default(),
        StaticRouting { groups: None },
        true,
        String::new(),
        String::new(),
        None,
    );
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let result = control.submit_request(submit_params(), &sink, &stop);
    assert_matches!(result, Err(WavereqError::StoreDisabled));
}

#[test]
fn purge_removes_payloads_and_the_record() {
    let (_dir, store) = temp_store();
    let routed = vec![group(QUERY_URL, &["APE", "KBU"])];
    let control = FdsnwsControl::new(
        MockData::default(),
        StaticRouting {
            groups: Some(routed),
        },
        true,
        "http://router.example/routing/1/query".to_string(),
        "/fdsnws".to_string(),
        Some(store.clone()),
    );
    let sink = RecordingSink::default();
    let stop = AtomicBool::new(false);

    let id = control.submit_request(submit_params(), &sink, &stop).unwrap();
    let record = store.get_request(id).unwrap().unwrap();
    let blob_ids: Vec<u64> = record
        .groups
        .iter()
        .flat_map(|group| {
            group
                .blob_id
                .into_iter()
                .chain(group.params.iter().filter_map(|param| param.blob_id))
        })
        .collect();
    assert!(!blob_ids.is_empty());

    control.purge(id).unwrap();
    assert!(store.get_request(id).unwrap().is_none());
    assert!(blob_ids.iter().all(|&blob_id| !store.has_blob(blob_id)));

    // Purging again is a no-op.
    control.purge(id).unwrap();
}
