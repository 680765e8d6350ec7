use assert_matches::assert_matches;

use wavereq::domain::{
    EVENT_HEADER, EventBatch, EventRow, NetworkClass, Restriction, STATION_HEADER, StationBatch,
    StationRow,
};
use wavereq::error::WavereqError;
use wavereq::pack::Pack;
use wavereq::request::RequestController;
use wavereq::settings::Settings;

fn station_header() -> Vec<String> {
    STATION_HEADER.iter().map(|s| s.to_string()).collect()
}

fn event_header() -> Vec<String> {
    EVENT_HEADER.iter().map(|s| s.to_string()).collect()
}

fn station(key: &str, net: &str, sta: &str, streams: &[(&str, u8)]) -> StationRow {
    StationRow {
        key: key.to_string(),
        network: net.to_string(),
        station: sta.to_string(),
        latitude: 0.0,
        longitude: 0.0,
        restriction: Restriction::NONE,
        net_class: NetworkClass::Permanent,
        archive: "GFZ".to_string(),
        operator: "GEOFON".to_string(),
        streams: streams.iter().map(|(code, _)| code.parse().unwrap()).collect(),
        stream_restrictions: streams.iter().map(|(_, r)| Restriction(*r)).collect(),
        filtered_streams: Vec::new(),
        selected: false,
    }
}

fn event(key: &str, time: &str) -> EventRow {
    EventRow {
        key: key.to_string(),
        datetime: time.to_string(),
        magnitude: Some(5.0),
        magnitude_type: "Mw".to_string(),
        latitude: 35.0,
        longitude: 25.0,
        depth_km: 10.0,
        region: "Crete".to_string(),
        selected: false,
    }
}

#[test]
fn duplicate_stations_are_skipped_duplicate_events_fail() {
    let mut pack = Pack::new(1);

    pack.add_stations(&StationBatch {
        header: station_header(),
        rows: vec![station("GE-APE", "GE", "APE", &[(".BHZ", 2)])],
    });
    pack.add_stations(&StationBatch {
        header: station_header(),
        rows: vec![
            station("GE-APE", "GE", "APE", &[(".BHZ", 2)]),
            station("GE-KBU", "GE", "KBU", &[(".BHZ", 2)]),
        ],
    });
    assert_eq!(pack.stations_count(), 2);

    pack.add_events(&EventBatch {
        header: event_header(),
        rows: vec![event("evt-1", "2020-05-02 12:00:00")],
    })
    .unwrap();
    let err = pack.add_events(&EventBatch {
        header: event_header(),
        rows: vec![
            event("evt-2", "2020-05-03 12:00:00"),
            event("evt-1", "2020-05-02 12:00:00"),
        ],
    });
    assert_matches!(err, Err(WavereqError::DuplicateEventKey(key)) if key == "evt-1");

    // The failed batch must not be applied at all, not even its fresh rows.
    assert_eq!(pack.events_count(), 1);
}

#[test]
fn stream_filter_deselects_filtered_out_stations() {
    let mut pack = Pack::new(1);
    pack.add_stations(&StationBatch {
        header: station_header(),
        rows: vec![
            station("GE-APE", "GE", "APE", &[(".BHZ", 2), (".LHZ", 2)]),
            station("GE-KBU", "GE", "KBU", &[(".LHZ", 1)]),
        ],
    });

    // All facet values start enabled.
    assert_eq!(pack.stations()[0].filtered_streams.len(), 2);
    assert!(pack.stations()[1].selected);

    pack.filter_mut().set_sampling('L', false);
    pack.apply_stream_filter();

    let ape = &pack.stations()[0];
    assert_eq!(ape.filtered_streams.len(), 1);
    assert_eq!(ape.filtered_streams[0].sampling, 'B');
    assert!(ape.selected);
    assert!(ape.restriction.is_open());
    assert!(!ape.restriction.is_restricted());

    // KBU only had L-sampled streams and drops out of the selection.
    let kbu = &pack.stations()[1];
    assert!(kbu.filtered_streams.is_empty());
    assert!(!kbu.selected);

    // Reapplying with an unchanged filter changes nothing.
    pack.apply_stream_filter();
    assert_eq!(pack.stations()[0].filtered_streams.len(), 1);
    assert!(!pack.stations()[1].selected);
}

#[test]
fn restriction_is_or_of_retained_streams() {
    let mut pack = Pack::new(1);
    pack.add_stations(&StationBatch {
        header: station_header(),
        rows: vec![station("GE-APE", "GE", "APE", &[(".BHZ", 2), ("00.BHZ", 1)])],
    });

    let row = &pack.stations()[0];
    assert_eq!(row.restriction, Restriction::OPEN_AND_RESTRICTED);

    pack.filter_mut().set_location("00", false);
    pack.apply_stream_filter();
    let row = &pack.stations()[0];
    assert!(row.restriction.is_open());
    assert!(!row.restriction.is_restricted());
}

#[test]
fn projections_cover_only_selected_rows() {
    let mut pack = Pack::new(1);
    pack.add_stations(&StationBatch {
        header: station_header(),
        rows: vec![
            // Duplicate stream codes collapse to one line.
            station("GE-APE", "GE", "APE", &[(".BHZ", 2), (".BHZ", 2)]),
            station("GE-KBU", "GE", "KBU", &[(".BHN", 2)]),
        ],
    });
    pack.add_events(&EventBatch {
        header: event_header(),
        rows: vec![
            event("evt-1", "2020-05-02 12:00:00"),
            event("evt-2", "2020-05-03T01:02:03.456"),
        ],
    })
    .unwrap();

    assert!(pack.toggle_station("GE-KBU"));
    assert!(pack.toggle_event("evt-1"));
    assert!(!pack.toggle_event("missing"));

    let stations = pack.station_lines();
    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].station, "APE");
    assert_eq!(stations[0].channel, "BHZ");

    let events = pack.event_lines().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].time, "2020-05-03T01:02:03.456Z");
}

#[test]
fn freeze_discards_deselected_rows() {
    let mut pack = Pack::new(1);
    pack.add_stations(&StationBatch {
        header: station_header(),
        rows: vec![
            station("GE-APE", "GE", "APE", &[(".BHZ", 2)]),
            station("GE-KBU", "GE", "KBU", &[(".BHN", 2)]),
        ],
    });
    pack.add_events(&EventBatch {
        header: event_header(),
        rows: vec![
            event("evt-1", "2020-05-02 12:00:00"),
            event("evt-2", "2020-05-03 12:00:00"),
        ],
    })
    .unwrap();

    pack.toggle_station("GE-APE");
    pack.toggle_event("evt-2");
    pack.freeze();

    assert_eq!(pack.stations_count(), 1);
    assert_eq!(pack.stations()[0].key, "GE-KBU");
    assert_eq!(pack.events_count(), 1);
    assert_eq!(pack.events()[0].key, "evt-1");
}

#[test]
fn remove_stations_resets_the_filter_index() {
    let mut pack = Pack::new(1);
    pack.add_stations(&StationBatch {
        header: station_header(),
        rows: vec![station("GE-APE", "GE", "APE", &[("00.BHZ", 2)])],
    });
    assert!(pack.filter().locations().contains_key("00"));

    pack.remove_stations();
    assert!(!pack.has_station());
    assert!(pack.filter().locations().is_empty());

    // A later append reindexes from scratch.
    pack.add_stations(&StationBatch {
        header: station_header(),
        rows: vec![station("GE-KBU", "GE", "KBU", &[("10.BHZ", 2)])],
    });
    assert!(pack.filter().locations().contains_key("10"));
    assert!(!pack.filter().locations().contains_key("00"));
}

#[test]
fn emptying_both_collections_destroys_the_pack() {
    let mut controller = RequestController::new(Settings::default());
    controller.append_stations(&StationBatch {
        header: station_header(),
        rows: vec![station("GE-APE", "GE", "APE", &[(".BHZ", 2)])],
    });
    controller
        .append_events(&EventBatch {
            header: event_header(),
            rows: vec![event("evt-1", "2020-05-02 12:00:00")],
        })
        .unwrap();
    let first_id = controller.pack().unwrap().id();

    // One collection left: the pack survives.
    controller.remove_stations();
    let pack = controller.pack().unwrap();
    assert!(!pack.has_station());
    assert_eq!(pack.events_count(), 1);

    controller.remove_events();
    assert!(controller.pack().is_none());

    // Removal on an empty controller stays a no-op.
    controller.remove_events();
    assert!(controller.pack().is_none());

    // The next append starts a fresh pack under a new id.
    controller.append_stations(&StationBatch {
        header: station_header(),
        rows: vec![station("GE-KBU", "GE", "KBU", &[(".BHN", 2)])],
    });
    let pack = controller.pack().unwrap();
    assert_ne!(pack.id(), first_id);
    assert_eq!(pack.stations_count(), 1);
    assert!(!pack.has_event());
}
