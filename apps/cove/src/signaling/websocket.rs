use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use super::{
    CLOSE_POLICY_VIOLATION, RelayConnection, RelayConnector, RelayInbound, SignalingError,
};

/// Dials `{relay_url}/{token}?participantId={id}` over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    relay_url: String,
}

impl WebSocketConnector {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }

    pub fn session_url(&self, token: &str, participant_id: &str) -> Result<Url, SignalingError> {
        let base = self.relay_url.trim_end_matches('/');
        let mut url = Url::parse(base)
            .map_err(|err| SignalingError::Connect(format!("invalid relay url {base}: {err}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            "http" => url
                .set_scheme("ws")
                .map_err(|_| SignalingError::Connect("invalid websocket scheme".into()))?,
            "https" => url
                .set_scheme("wss")
                .map_err(|_| SignalingError::Connect("invalid websocket scheme".into()))?,
            other => {
                return Err(SignalingError::Connect(format!(
                    "unsupported relay scheme {other}"
                )));
            }
        }
        url.path_segments_mut()
            .map_err(|_| SignalingError::Connect("relay url cannot be a base".into()))?
            .pop_if_empty()
            .push(token);
        url.query_pairs_mut()
            .clear()
            .append_pair("participantId", participant_id);
        url.set_fragment(None);
        Ok(url)
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(
        &self,
        token: &str,
        participant_id: &str,
    ) -> Result<RelayConnection, SignalingError> {
        let url = self.session_url(token, participant_id)?;
        let (stream, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response)) if response.status().is_client_error() => {
                return Err(SignalingError::Refused(CLOSE_POLICY_VIOLATION));
            }
            Err(err) => {
                return Err(SignalingError::Connect(format!(
                    "websocket connect failed: {err}"
                )));
            }
        };
        let (mut ws_write, mut ws_read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayInbound>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let mut code = None;
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(RelayInbound::Text(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            if inbound_tx.send(RelayInbound::Text(text)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        code = frame.map(|frame| u16::from(frame.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target = "cove::signaling", error = %err, "relay websocket error");
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(RelayInbound::Closed { code });
        });

        Ok(RelayConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_appends_token_and_participant() {
        let connector = WebSocketConnector::new("https://relay.example/ws/sessions/");
        let url = connector.session_url("tok-1", "p 1").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://relay.example/ws/sessions/tok-1?participantId=p+1"
        );
    }

    #[test]
    fn rejects_unknown_schemes() {
        let connector = WebSocketConnector::new("ftp://relay.example/ws");
        assert!(matches!(
            connector.session_url("t", "p"),
            Err(SignalingError::Connect(_))
        ));
    }
}
