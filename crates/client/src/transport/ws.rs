use futures::{future, StreamExt};
use pocketping_protocol::ServerEvent;
use reqwest::Url;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use super::EventStream;
use crate::error::{ClientError, Result};

pub(super) async fn open(base_url: &str, session_id: &str) -> Result<EventStream> {
    let url = ws_url(base_url, session_id)?;
    debug!(
        component = "client",
        event = "client.ws.connecting",
        url = %url,
        "Opening WebSocket"
    );
    let (socket, _) = connect_async(url.as_str()).await?;

    let events = socket
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| future::ready(decode(frame)));
    Ok(events.boxed())
}

fn ws_url(base_url: &str, session_id: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| ClientError::Transport(format!("invalid base url {base_url}: {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|()| ClientError::Transport(format!("cannot use {scheme} for {base_url}")))?;
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("sessionId", session_id);
    Ok(url)
}

fn decode(frame: std::result::Result<Message, tungstenite::Error>) -> Option<Result<ServerEvent>> {
    match frame {
        Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                warn!(
                    component = "client",
                    event = "client.ws.bad_frame",
                    error = %e,
                    "Skipping undecodable frame"
                );
                None
            }
        },
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_scheme_and_adds_session() {
        let url = ws_url("https://chat.example.com", "s 1").unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/ws?sessionId=s+1");

        let url = ws_url("http://127.0.0.1:3001", "abc").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:3001/ws?sessionId=abc");
    }

    #[test]
    fn text_frames_decode_and_garbage_is_skipped() {
        let frame = Ok(Message::text(r#"{"type":"presence","data":{"online":true}}"#));
        assert!(matches!(
            decode(frame),
            Some(Ok(ServerEvent::Presence(p))) if p.online
        ));

        assert!(decode(Ok(Message::text("not json"))).is_none());
        assert!(decode(Ok(Message::Ping(Vec::new().into()))).is_none());
        assert!(matches!(
            decode(Err(tungstenite::Error::ConnectionClosed)),
            Some(Err(ClientError::Transport(_)))
        ));
    }
}
