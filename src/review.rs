use std::collections::BTreeMap;

use crate::domain::LineItem;

/// Editable network → station → {time windows, channels} view of a flat
/// time-window list, used by the pre-submission review step. Sizes are kept
/// in a side table keyed by (window, channel); combinations the backend never
/// reported have no entry and are dropped again on flatten.
#[derive(Debug, Default)]
pub struct TwTree {
    nets: BTreeMap<String, NetNode>,
}

#[derive(Debug, Default)]
pub struct NetNode {
    stations: BTreeMap<String, StaNode>,
}

#[derive(Debug, Default)]
pub struct StaNode {
    windows: BTreeMap<String, TimeWindow>,
    channels: BTreeMap<String, ChannelSel>,
    sizes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct TimeWindow {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone)]
pub struct ChannelSel {
    pub enabled: bool,
    pub channel: String,
    pub location: String,
}

impl TwTree {
    pub fn steepen(items: &[LineItem]) -> Self {
        let mut tree = TwTree::default();

        for item in items {
            let sta = tree
                .nets
                .entry(item.network.clone())
                .or_default()
                .stations
                .entry(item.station.clone())
                .or_default();

            let tw_key = window_key(&item.start, &item.end);
            sta.windows.entry(tw_key.clone()).or_insert(TimeWindow {
                enabled: true,
                start: item.start.clone(),
                end: item.end.clone(),
            });

            let ch_key = channel_key(&item.location, &item.channel);
            sta.channels.entry(ch_key.clone()).or_insert(ChannelSel {
                enabled: true,
                channel: item.channel.clone(),
                location: item.location.clone(),
            });

            if let Some(size) = item.size {
                sta.sizes.insert(size_key(&tw_key, &ch_key), size);
            }
        }

        tree
    }

    /// Emit one line per enabled (window, channel) pair that has a size
    /// entry. With no edits applied this reproduces the steepened input.
    pub fn flatten(&self) -> Vec<LineItem> {
        let mut items = Vec::new();

        for (net_code, net) in &self.nets {
            for (sta_code, sta) in &net.stations {
                for (tw_key, tw) in &sta.windows {
                    if !tw.enabled {
                        continue;
                    }
                    for (ch_key, ch) in &sta.channels {
                        if !ch.enabled {
                            continue;
                        }
                        let Some(&size) = sta.sizes.get(&size_key(tw_key, ch_key)) else {
                            continue;
                        };
                        items.push(LineItem {
                            start: tw.start.clone(),
                            end: tw.end.clone(),
                            network: net_code.clone(),
                            station: sta_code.clone(),
                            channel: ch.channel.clone(),
                            location: ch.location.clone(),
                            size: Some(size),
                        });
                    }
                }
            }
        }

        items
    }

    /// Cascade: toggling a network toggles all its stations.
    pub fn set_network(&mut self, net: &str, enabled: bool) {
        if let Some(node) = self.nets.get_mut(net) {
            for sta in node.stations.values_mut() {
                set_station_node(sta, enabled);
            }
        }
    }

    /// Cascade: toggling a station toggles its time windows.
    pub fn set_station(&mut self, net: &str, sta: &str, enabled: bool) {
        if let Some(node) = self.station_mut(net, sta) {
            for tw in node.windows.values_mut() {
                tw.enabled = enabled;
            }
        }
    }

    pub fn set_window(&mut self, net: &str, sta: &str, tw_key: &str, enabled: bool) {
        if let Some(node) = self.station_mut(net, sta)
            && let Some(tw) = node.windows.get_mut(tw_key)
        {
            tw.enabled = enabled;
        }
    }

    /// Adjust a window's bounds in place. The size table stays keyed by the
    /// original bounds, assuming the data size did not change.
    pub fn set_window_range(&mut self, net: &str, sta: &str, tw_key: &str, start: &str, end: &str) {
        if let Some(node) = self.station_mut(net, sta)
            && let Some(tw) = node.windows.get_mut(tw_key)
        {
            tw.start = start.to_string();
            tw.end = end.to_string();
        }
    }

    pub fn set_channel(&mut self, net: &str, sta: &str, ch_key: &str, enabled: bool) {
        if let Some(node) = self.station_mut(net, sta)
            && let Some(ch) = node.channels.get_mut(ch_key)
        {
            ch.enabled = enabled;
        }
    }

    /// Channel checkboxes become irrelevant once no window of the station is
    /// enabled; the UI layer uses this to grey them out.
    pub fn station_has_enabled_window(&self, net: &str, sta: &str) -> bool {
        self.nets
            .get(net)
            .and_then(|node| node.stations.get(sta))
            .map(|node| node.windows.values().any(|tw| tw.enabled))
            .unwrap_or(false)
    }

    pub fn networks(&self) -> impl Iterator<Item = (&String, &NetNode)> {
        self.nets.iter()
    }

    fn station_mut(&mut self, net: &str, sta: &str) -> Option<&mut StaNode> {
        self.nets.get_mut(net)?.stations.get_mut(sta)
    }
}

impl NetNode {
    pub fn stations(&self) -> impl Iterator<Item = (&String, &StaNode)> {
        self.stations.iter()
    }
}

impl StaNode {
    pub fn windows(&self) -> impl Iterator<Item = (&String, &TimeWindow)> {
        self.windows.iter()
    }

    pub fn channels(&self) -> impl Iterator<Item = (&String, &ChannelSel)> {
        self.channels.iter()
    }
}

pub fn window_key(start: &str, end: &str) -> String {
    format!("{start}{end}")
}

pub fn channel_key(location: &str, channel: &str) -> String {
    format!("{location}{channel}")
}

fn size_key(tw_key: &str, ch_key: &str) -> String {
    format!("{tw_key}{ch_key}")
}

fn set_station_node(sta: &mut StaNode, enabled: bool) {
    for tw in sta.windows.values_mut() {
        tw.enabled = enabled;
    }
    for ch in sta.channels.values_mut() {
        ch.enabled = enabled;
    }
}
