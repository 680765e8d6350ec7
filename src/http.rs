use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::WavereqError;

pub(crate) fn build_client() -> Result<Client, WavereqError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("wavereq/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| WavereqError::Filesystem(err.to_string()))?,
    );

    Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|err| WavereqError::MetadataHttp(err.to_string()))
}

/// Retry transient failures with a linear backoff; non-transient statuses are
/// returned to the caller for mapping.
pub(crate) fn send_with_retries<F, E>(
    mut make_req: F,
    map_err: E,
) -> Result<reqwest::blocking::Response, WavereqError>
where
    F: FnMut() -> reqwest::blocking::RequestBuilder,
    E: Fn(String) -> WavereqError,
{
    const MAX_RETRIES: usize = 3;
    const BASE_DELAY_MS: u64 = 200;
    let mut attempt = 0usize;
    loop {
        match make_req().send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    continue;
                }
                return Err(map_err(err.to_string()));
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
