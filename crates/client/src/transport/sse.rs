use futures::{stream, StreamExt};
use pocketping_protocol::ServerEvent;
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

use super::EventStream;
use crate::error::Result;

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Chunks may split lines and UTF-8
/// sequences anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    current: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if self.has_data {
                    frames.push(std::mem::take(&mut self.current));
                } else {
                    self.current = SseFrame::default();
                }
                self.has_data = false;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_ref(), ""),
            };
            match field {
                "event" => self.current.event = Some(value.to_string()),
                "id" => self.current.id = Some(value.to_string()),
                "data" => {
                    if self.has_data {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                    self.has_data = true;
                }
                _ => {}
            }
        }
        frames
    }
}

pub(super) async fn open(
    http: &reqwest::Client,
    base_url: &str,
    session_id: &str,
    cursor: Option<&str>,
) -> Result<EventStream> {
    let mut params = vec![("sessionId", session_id)];
    if let Some(after) = cursor {
        params.push(("after", after));
    }
    debug!(
        component = "client",
        event = "client.sse.connecting",
        session_id = %session_id,
        after = ?cursor,
        "Opening event stream"
    );
    let response = http
        .get(format!("{base_url}/api/stream"))
        .header(ACCEPT, "text/event-stream")
        .query(&params)
        .send()
        .await?
        .error_for_status()?;

    let mut decoder = SseDecoder::default();
    let events = response
        .bytes_stream()
        .map(move |chunk| -> Vec<Result<ServerEvent>> {
            match chunk {
                Ok(bytes) => decoder
                    .feed(&bytes)
                    .into_iter()
                    .filter_map(parse_frame)
                    .collect(),
                Err(e) => vec![Err(e.into())],
            }
        })
        .flat_map(stream::iter);
    Ok(events.boxed())
}

fn parse_frame(frame: SseFrame) -> Option<Result<ServerEvent>> {
    match serde_json::from_str::<ServerEvent>(&frame.data) {
        Ok(event) => Some(Ok(event)),
        Err(e) => {
            warn!(
                component = "client",
                event = "client.sse.bad_frame",
                kind = ?frame.event,
                error = %e,
                "Skipping undecodable event"
            );
            None
        }
    }
}
