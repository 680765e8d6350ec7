use std::io::{self, Write};

use serde::Serialize;
use serde_json::json;

use crate::fdsnws::{LineStatus, StatusSink};
use crate::router::RouteParam;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// JSON-lines progress on stdout, one object per line event.
impl StatusSink for JsonOutput {
    fn line(&self, request_id: u64, param: &RouteParam, status: LineStatus, detail: &str) {
        let event = json!({
            "request": request_id,
            "line": param.request_line(),
            "status": status.to_string(),
            "detail": detail,
        });
        println!("{event}");
    }

    fn progress(&self, _request_id: u64, _done: usize, _total: usize) {}
}
