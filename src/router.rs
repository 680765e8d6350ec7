use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::LineItem;
use crate::error::WavereqError;

/// One constraint line of a resolved route. `blob_id` is the persistent key
/// of the fetched payload, assigned when the request record is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteParam {
    pub net: String,
    pub sta: String,
    pub loc: String,
    pub cha: String,
    pub start: String,
    pub end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<u64>,
}

impl RouteParam {
    pub fn from_line_item(item: &LineItem) -> Self {
        Self {
            net: item.network.clone(),
            sta: item.station.clone(),
            loc: item.location_or_dashes().to_string(),
            cha: item.channel.clone(),
            start: item.start.clone(),
            end: item.end.clone(),
            priority: None,
            blob_id: None,
        }
    }

    /// Query parameters for a per-line GET (everything except the local
    /// bookkeeping fields).
    pub fn query_pairs(&self) -> [(&'static str, &str); 6] {
        [
            ("net", &self.net),
            ("sta", &self.sta),
            ("loc", &self.loc),
            ("cha", &self.cha),
            ("start", &self.start),
            ("end", &self.end),
        ]
    }

    pub fn request_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.net, self.sta, self.loc, self.cha, self.start, self.end
        )
    }
}

/// A resolved data-center target with the line items assigned to it.
/// `blob_id` keys the single payload of a bulk fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteGroup {
    pub url: String,
    #[serde(default)]
    pub params: Vec<RouteParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<u64>,
}

/// Resolves routes for a flat line-item list, as the routing service does.
pub trait RoutingClient: Send + Sync {
    /// Returns the parsed route array, or `None` when the service responded
    /// with an empty document.
    fn resolve(&self, url: &str, body: &str) -> Result<Option<Vec<RouteGroup>>, WavereqError>;
}

pub struct HttpRoutingClient {
    client: reqwest::blocking::Client,
}

impl HttpRoutingClient {
    pub fn new() -> Result<Self, WavereqError> {
        Ok(Self {
            client: crate::http::build_client()?,
        })
    }
}

impl RoutingClient for HttpRoutingClient {
    fn resolve(&self, url: &str, body: &str) -> Result<Option<Vec<RouteGroup>>, WavereqError> {
        let response = crate::http::send_with_retries(
            || {
                self.client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(body.to_string())
            },
            WavereqError::RoutingHttp,
        )?;

        let status = response.status();
        if status.as_u16() == 204 {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(WavereqError::RoutingStatus {
                status: status.as_u16(),
                message,
            });
        }

        let text = response
            .text()
            .map_err(|err| WavereqError::RoutingHttp(err.to_string()))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let routes = serde_json::from_str(&text)
            .map_err(|err| WavereqError::RoutingHttp(err.to_string()))?;
        Ok(Some(routes))
    }
}

/// The plain-text routing request: option lines followed by one
/// `NET STA LOC CHA START END` line per item.
pub fn routing_request_body(service: &str, items: &[LineItem]) -> String {
    let mut body = format!("service={service}\nformat=json\n");
    for item in items {
        body.push_str(&item.request_line());
        body.push('\n');
    }
    body
}

/// Resolve through the routing service. An empty or absent route list is a
/// hard failure: nothing may be created from it.
pub fn resolve_routes(
    client: &dyn RoutingClient,
    router_url: &str,
    service: &str,
    items: &[LineItem],
) -> Result<Vec<RouteGroup>, WavereqError> {
    let body = routing_request_body(service, items);
    let routes = client
        .resolve(router_url, &body)?
        .filter(|routes| !routes.is_empty())
        .ok_or(WavereqError::NoRoutes)?;
    Ok(routes)
}

/// Routing disabled: one synthetic route against the local FDSNWS root.
/// Dataselect goes straight to `queryauth`, everything else to `query`.
pub fn direct_routes(fdsnws_root: &str, service: &str, items: &[LineItem]) -> Vec<RouteGroup> {
    let endpoint = if service == "dataselect" {
        "queryauth"
    } else {
        "query"
    };
    vec![RouteGroup {
        url: format!("{fdsnws_root}/{service}/1/{endpoint}"),
        params: items.iter().map(RouteParam::from_line_item).collect(),
        blob_id: None,
    }]
}

/// Global options of a download, encoded as `key=value` lines ahead of the
/// constraint rows in bulk requests.
pub fn options_prefix(options: &BTreeMap<String, String>) -> String {
    let mut prefix = String::new();
    for (key, value) in options {
        prefix.push_str(key);
        prefix.push('=');
        prefix.push_str(value);
        prefix.push('\n');
    }
    prefix
}
