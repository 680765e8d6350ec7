use std::collections::{BTreeMap, HashSet};

use tracing::warn;

use crate::domain::{
    EVENT_HEADER, EventBatch, EventLine, Restriction, STATION_HEADER, StationBatch, StationLine,
    StreamCode, to_utc_iso,
};
use crate::error::WavereqError;

/// Per-facet channel filter. Rebuilt from the station set on every append,
/// with every facet value enabled; the UI layer toggles individual values and
/// then reapplies.
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    locations: BTreeMap<String, bool>,
    samplings: BTreeMap<char, bool>,
    gains: BTreeMap<char, bool>,
    orientations: BTreeMap<char, bool>,
}

impl StreamFilter {
    fn index_stream(&mut self, code: &StreamCode) {
        self.locations.entry(code.location.clone()).or_insert(true);
        self.samplings.entry(code.sampling).or_insert(true);
        self.gains.entry(code.gain).or_insert(true);
        self.orientations.entry(code.orientation).or_insert(true);
    }

    pub fn allows(&self, code: &StreamCode) -> bool {
        self.locations.get(&code.location).copied().unwrap_or(false)
            && self.samplings.get(&code.sampling).copied().unwrap_or(false)
            && self.gains.get(&code.gain).copied().unwrap_or(false)
            && self
                .orientations
                .get(&code.orientation)
                .copied()
                .unwrap_or(false)
    }

    pub fn set_location(&mut self, location: &str, enabled: bool) {
        if let Some(flag) = self.locations.get_mut(location) {
            *flag = enabled;
        }
    }

    pub fn set_sampling(&mut self, sampling: char, enabled: bool) {
        if let Some(flag) = self.samplings.get_mut(&sampling) {
            *flag = enabled;
        }
    }

    pub fn set_gain(&mut self, gain: char, enabled: bool) {
        if let Some(flag) = self.gains.get_mut(&gain) {
            *flag = enabled;
        }
    }

    pub fn set_orientation(&mut self, orientation: char, enabled: bool) {
        if let Some(flag) = self.orientations.get_mut(&orientation) {
            *flag = enabled;
        }
    }

    pub fn locations(&self) -> &BTreeMap<String, bool> {
        &self.locations
    }

    pub fn samplings(&self) -> &BTreeMap<char, bool> {
        &self.samplings
    }

    pub fn gains(&self) -> &BTreeMap<char, bool> {
        &self.gains
    }

    pub fn orientations(&self) -> &BTreeMap<char, bool> {
        &self.orientations
    }
}

/// The in-memory aggregate of the current selection: one station collection
/// and one event collection, either of which may be absent.
#[derive(Debug)]
pub struct Pack {
    id: u64,
    stations: Option<Vec<crate::domain::StationRow>>,
    events: Option<Vec<crate::domain::EventRow>>,
    filter: StreamFilter,
}

impl Pack {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            stations: None,
            events: None,
            filter: StreamFilter::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn has_station(&self) -> bool {
        self.stations.is_some()
    }

    pub fn has_event(&self) -> bool {
        self.events.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_none() && self.events.is_none()
    }

    pub fn stations(&self) -> &[crate::domain::StationRow] {
        self.stations.as_deref().unwrap_or(&[])
    }

    pub fn events(&self) -> &[crate::domain::EventRow] {
        self.events.as_deref().unwrap_or(&[])
    }

    pub fn stations_count(&self) -> usize {
        self.stations().len()
    }

    pub fn events_count(&self) -> usize {
        self.events().len()
    }

    pub fn events_selected_count(&self) -> usize {
        self.events().iter().filter(|row| row.selected).count()
    }

    pub fn filter(&self) -> &StreamFilter {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut StreamFilter {
        &mut self.filter
    }

    /// Append an event batch. Duplicate keys mean the upstream catalog is
    /// inconsistent and are a hard failure; nothing of the batch is applied
    /// in that case.
    pub fn add_events(&mut self, batch: &EventBatch) -> Result<(), WavereqError> {
        check_header("event", &batch.header, &EVENT_HEADER);

        let mut keys: HashSet<&str> = self.events().iter().map(|row| row.key.as_str()).collect();
        for row in &batch.rows {
            if !keys.insert(&row.key) {
                return Err(WavereqError::DuplicateEventKey(row.key.clone()));
            }
        }

        let list = self.events.get_or_insert_with(Vec::new);
        for row in &batch.rows {
            let mut row = row.clone();
            row.selected = true;
            list.push(row);
        }
        Ok(())
    }

    /// Append a station batch. Duplicate keys legitimately occur across
    /// overlapping queries and are dropped with a warning. The channel filter
    /// index is rebuilt and reapplied afterwards.
    pub fn add_stations(&mut self, batch: &StationBatch) {
        check_header("station", &batch.header, &STATION_HEADER);

        let list = self.stations.get_or_insert_with(Vec::new);
        let mut keys: HashSet<String> = list.iter().map(|row| row.key.clone()).collect();
        for row in &batch.rows {
            if !keys.insert(row.key.clone()) {
                warn!("ignoring duplicate station item {}", row.key);
                continue;
            }
            let mut row = row.clone();
            row.selected = true;
            list.push(row);
        }

        self.rebuild_filter_index();
        self.apply_stream_filter();
    }

    fn rebuild_filter_index(&mut self) {
        let mut filter = StreamFilter::default();
        for row in self.stations.as_deref().unwrap_or(&[]) {
            for code in &row.streams {
                filter.index_stream(code);
            }
        }
        self.filter = filter;
    }

    /// Recompute every station's filtered stream list from the current
    /// filter. A station whose streams are all filtered out is deselected;
    /// otherwise its aggregate restriction flag is the OR over the retained
    /// streams. Reapplying with an unchanged filter is a no-op.
    pub fn apply_stream_filter(&mut self) {
        let Some(stations) = self.stations.as_mut() else {
            return;
        };

        for row in stations.iter_mut() {
            let mut filtered = Vec::new();
            let mut restriction = Restriction::NONE;

            for (i, code) in row.streams.iter().enumerate() {
                if self.filter.allows(code) {
                    filtered.push(code.clone());
                    restriction = restriction.merge(
                        row.stream_restrictions
                            .get(i)
                            .copied()
                            .unwrap_or(Restriction::NONE),
                    );
                }
            }

            row.filtered_streams = filtered;
            if row.filtered_streams.is_empty() {
                row.selected = false;
            } else {
                row.restriction = restriction;
            }
        }
    }

    pub fn toggle_station(&mut self, key: &str) -> bool {
        match self
            .stations
            .as_mut()
            .and_then(|rows| rows.iter_mut().find(|row| row.key == key))
        {
            Some(row) => {
                row.selected = !row.selected;
                true
            }
            None => false,
        }
    }

    pub fn toggle_event(&mut self, key: &str) -> bool {
        match self
            .events
            .as_mut()
            .and_then(|rows| rows.iter_mut().find(|row| row.key == key))
        {
            Some(row) => {
                row.selected = !row.selected;
                true
            }
            None => false,
        }
    }

    /// Selected events as (lat, lon, depth, UTC ISO time) lines.
    pub fn event_lines(&self) -> Result<Vec<EventLine>, WavereqError> {
        let mut lines = Vec::new();
        for row in self.events() {
            if !row.selected {
                continue;
            }
            lines.push(EventLine {
                latitude: row.latitude,
                longitude: row.longitude,
                depth_km: row.depth_km,
                time: to_utc_iso(&row.datetime)?,
            });
        }
        Ok(lines)
    }

    /// Selected stations flattened to one line per unique filtered stream.
    pub fn station_lines(&self) -> Vec<StationLine> {
        let mut lines = Vec::new();
        for row in self.stations() {
            if !row.selected {
                continue;
            }
            let mut seen = HashSet::new();
            for code in &row.filtered_streams {
                if !seen.insert(code) {
                    continue;
                }
                lines.push(StationLine {
                    network: row.network.clone(),
                    station: row.station.clone(),
                    channel: code.channel(),
                    location: code.location.clone(),
                });
            }
        }
        lines
    }

    /// Discard every non-selected row, locking in the current selection.
    /// Irreversible for this pack.
    pub fn freeze(&mut self) {
        if let Some(events) = self.events.as_mut() {
            events.retain(|row| row.selected);
        }
        if let Some(stations) = self.stations.as_mut() {
            stations.retain(|row| row.selected);
        }
    }

    pub fn remove_stations(&mut self) {
        self.stations = None;
        self.filter = StreamFilter::default();
    }

    pub fn remove_events(&mut self) {
        self.events = None;
    }
}

fn check_header(kind: &str, header: &[String], expected: &[&str]) {
    if header.len() != expected.len()
        || header.iter().zip(expected).any(|(got, want)| got != want)
    {
        warn!(
            "{kind} header {header:?} does not match the expected column schema {expected:?}"
        );
    }
}
