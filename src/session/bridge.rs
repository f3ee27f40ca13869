//! WebSocket bridge to a sidecar hosting the messaging library.
//!
//! The sidecar owns the protocol, encryption and QR login. This side speaks
//! one JSON object per text frame:
//!
//! ```text
//! -> {"type":"auth","credentials":"<base64>"|null}
//! -> {"type":"send","to":"<address>","text":"...","forwarded":false}
//! -> {"type":"creds_ack","ok":true}
//! <- {"type":"open","self_id":"<address>"}
//! <- {"type":"creds","credentials":"<base64>"}
//! <- {"type":"message","remote_jid":"<address>","from_me":false,"message":{"conversation":"..."}}
//! <- {"type":"close","status_code":401}
//! ```
//!
//! The reader waits for the supervisor's acknowledgement of a `creds` frame
//! before reading further, and forwards it to the sidecar as `creds_ack`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{SendError, SessionError};
use crate::session::transport::{
    Connector, Credentials, DisconnectReason, LinkEvent, MessageBody, OutgoingMessage, RawMessage,
    SessionLink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Capacity of the per-session event queue.
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Frames sent by the sidecar.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Open {
        #[serde(default)]
        self_id: Option<String>,
    },
    Creds {
        credentials: String,
    },
    Message {
        remote_jid: String,
        #[serde(default)]
        from_me: bool,
        #[serde(default)]
        message: Option<BridgeMessage>,
    },
    Close {
        #[serde(default)]
        status_code: Option<u16>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct BridgeMessage {
    #[serde(default)]
    conversation: Option<String>,
    #[serde(default)]
    extended_text: Option<String>,
}

impl BridgeMessage {
    fn into_body(self) -> MessageBody {
        match (self.conversation, self.extended_text) {
            (Some(text), _) if !text.is_empty() => MessageBody::Conversation(text),
            (_, Some(text)) if !text.is_empty() => MessageBody::ExtendedText(text),
            _ => MessageBody::Unsupported,
        }
    }
}

/// Frames sent to the sidecar.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Auth { credentials: Option<String> },
    Send {
        to: &'a str,
        text: &'a str,
        forwarded: bool,
    },
    CredsAck { ok: bool },
}

/// Connects to the sidecar over WebSocket.
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    url: Url,
    connect_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<(Arc<dyn SessionLink>, mpsc::Receiver<LinkEvent>), SessionError> {
        let (ws_stream, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| SessionError::ConnectFailed {
            reason: format!("timed out connecting to bridge at {}", self.url),
        })?
        .map_err(|e| SessionError::ConnectFailed {
            reason: format!("bridge connection to {} failed: {e}", self.url),
        })?;

        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let auth = ClientFrame::Auth {
            credentials: credentials.map(|c| BASE64.encode(c.as_bytes())),
        };
        send_frame(&write, &auth)
            .await
            .map_err(|cause| SessionError::ConnectFailed {
                reason: format!("bridge auth frame failed: {cause}"),
            })?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_frames(read, Arc::clone(&write), tx));

        tracing::debug!(url = %self.url, "Connected to messaging bridge");
        let link = BridgeLink {
            write,
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        };
        Ok((Arc::new(link), rx))
    }
}

/// Sending half of a bridge session.
pub struct BridgeLink {
    write: Arc<Mutex<WsWrite>>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SessionLink for BridgeLink {
    async fn send(&self, address: &str, message: &OutgoingMessage) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }
        let frame = ClientFrame::Send {
            to: address,
            text: &message.text,
            forwarded: message.forwarded,
        };
        send_frame(&self.write, &frame)
            .await
            .map_err(|cause| SendError::SendFailed { cause })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.write.lock().await.send(Message::Close(None)).await;
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
    }
}

async fn send_frame(write: &Mutex<WsWrite>, frame: &ClientFrame<'_>) -> Result<(), String> {
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    let mut writer = write.lock().await;
    writer
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Pump sidecar frames into link events until the socket ends.
async fn read_frames(mut read: WsRead, write: Arc<Mutex<WsWrite>>, tx: mpsc::Sender<LinkEvent>) {
    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Bridge read failed");
                break;
            }
        };

        let frame: BridgeFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unparseable bridge frame");
                continue;
            }
        };

        match frame {
            BridgeFrame::Creds { credentials } => {
                let bytes = match BASE64.decode(credentials.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = %e, "Bridge sent undecodable credentials");
                        let _ = send_frame(&write, &ClientFrame::CredsAck { ok: false }).await;
                        continue;
                    }
                };
                let (ack_tx, ack_rx) = oneshot::channel();
                let event = LinkEvent::CredentialsUpdated {
                    credentials: Credentials::new(bytes),
                    ack: Some(ack_tx),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
                let ok = ack_rx.await.unwrap_or(false);
                if let Err(e) = send_frame(&write, &ClientFrame::CredsAck { ok }).await {
                    tracing::debug!(error = %e, "Failed to acknowledge credentials");
                }
            }
            BridgeFrame::Close { status_code } => {
                let reason = DisconnectReason::from_status_code(status_code);
                let _ = tx.send(LinkEvent::Closed(reason)).await;
                return;
            }
            other => {
                if let Some(event) = frame_to_event(other)
                    && tx.send(event).await.is_err()
                {
                    return;
                }
            }
        }
    }
    // Dropping `tx` without a Closed event reads as a lost connection.
}

fn frame_to_event(frame: BridgeFrame) -> Option<LinkEvent> {
    match frame {
        BridgeFrame::Open { self_id } => Some(LinkEvent::Open {
            self_address: self_id,
        }),
        BridgeFrame::Message {
            remote_jid,
            from_me,
            message,
        } => Some(LinkEvent::Message(RawMessage {
            remote_address: remote_jid,
            from_me,
            body: message.unwrap_or_default().into_body(),
        })),
        BridgeFrame::Close { status_code } => Some(LinkEvent::Closed(
            DisconnectReason::from_status_code(status_code),
        )),
        BridgeFrame::Creds { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    fn parse(value: Value) -> BridgeFrame {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_message_frame_prefers_conversation() {
        let frame = parse(json!({
            "type": "message",
            "remote_jid": "15551234567@s.whatsapp.net",
            "message": { "conversation": ".ping", "extended_text": "ignored" }
        }));
        match frame_to_event(frame) {
            Some(LinkEvent::Message(raw)) => {
                assert_eq!(raw.remote_address, "15551234567@s.whatsapp.net");
                assert!(!raw.from_me);
                assert_eq!(raw.body, MessageBody::Conversation(".ping".to_string()));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_message_frame_falls_back_to_extended_text() {
        let frame = parse(json!({
            "type": "message",
            "remote_jid": "15551234567@s.whatsapp.net",
            "from_me": true,
            "message": { "extended_text": ".uptime" }
        }));
        match frame_to_event(frame) {
            Some(LinkEvent::Message(raw)) => {
                assert!(raw.from_me);
                assert_eq!(raw.body, MessageBody::ExtendedText(".uptime".to_string()));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_message_frame_without_text_is_unsupported() {
        let frame = parse(json!({
            "type": "message",
            "remote_jid": "15551234567@s.whatsapp.net"
        }));
        match frame_to_event(frame) {
            Some(LinkEvent::Message(raw)) => assert_eq!(raw.body, MessageBody::Unsupported),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_close_frame_maps_status_code() {
        let frame = parse(json!({ "type": "close", "status_code": 401 }));
        assert!(matches!(
            frame_to_event(frame),
            Some(LinkEvent::Closed(DisconnectReason::LoggedOut))
        ));
    }

    #[test]
    fn test_client_frames_serialize() {
        let send = serde_json::to_value(ClientFrame::Send {
            to: "15551234567@s.whatsapp.net",
            text: "hi",
            forwarded: true,
        })
        .unwrap();
        assert_eq!(
            send,
            json!({
                "type": "send",
                "to": "15551234567@s.whatsapp.net",
                "text": "hi",
                "forwarded": true
            })
        );

        let auth = serde_json::to_value(ClientFrame::Auth { credentials: None }).unwrap();
        assert_eq!(auth, json!({ "type": "auth", "credentials": null }));
    }

    #[tokio::test]
    async fn test_round_trip_against_local_bridge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (acked_tx, acked_rx) = oneshot::channel();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            let auth = ws.next().await.unwrap().unwrap();
            let auth: Value = serde_json::from_str(auth.to_text().unwrap()).unwrap();
            assert_eq!(auth["type"], "auth");
            assert_eq!(auth["credentials"], BASE64.encode(b"old"));

            let frames = [
                json!({ "type": "open", "self_id": "15550000000@s.whatsapp.net" }),
                json!({ "type": "creds", "credentials": BASE64.encode(b"new") }),
            ];
            for frame in frames {
                ws.send(Message::Text(frame.to_string().into())).await.unwrap();
            }

            let ack = ws.next().await.unwrap().unwrap();
            let ack: Value = serde_json::from_str(ack.to_text().unwrap()).unwrap();
            assert_eq!(ack, json!({ "type": "creds_ack", "ok": true }));
            acked_tx.send(()).unwrap();

            let send = ws.next().await.unwrap().unwrap();
            let send: Value = serde_json::from_str(send.to_text().unwrap()).unwrap();
            assert_eq!(send["type"], "send");
            assert_eq!(send["text"], "🏓 Pong!");

            ws.send(Message::Text(
                json!({ "type": "close", "status_code": 428 }).to_string().into(),
            ))
            .await
            .unwrap();
        });

        let url = Url::parse(&format!("ws://{addr}")).unwrap();
        let connector = BridgeConnector::new(url, Duration::from_secs(5));
        let (link, mut events) = connector
            .connect(Some(Credentials::new(b"old".to_vec())))
            .await
            .unwrap();

        match events.recv().await {
            Some(LinkEvent::Open { self_address }) => {
                assert_eq!(self_address.as_deref(), Some("15550000000@s.whatsapp.net"));
            }
            other => panic!("expected open, got {:?}", other),
        }
        match events.recv().await {
            Some(LinkEvent::CredentialsUpdated { credentials, ack }) => {
                assert_eq!(credentials.as_bytes(), b"new");
                ack.unwrap().send(true).unwrap();
            }
            other => panic!("expected creds, got {:?}", other),
        }
        // The reader writes creds_ack on its own task; let the sidecar see it
        // before the outgoing message.
        tokio::time::timeout(Duration::from_secs(2), acked_rx)
            .await
            .expect("creds_ack not received")
            .unwrap();

        link.send(
            "15551234567@s.whatsapp.net",
            &OutgoingMessage::text("🏓 Pong!"),
        )
        .await
        .unwrap();

        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::Closed(DisconnectReason::ConnectionClosed))
        ));

        server.await.unwrap();
        link.close().await;
        assert_eq!(
            link.send("15551234567@s.whatsapp.net", &OutgoingMessage::text("x"))
                .await
                .unwrap_err(),
            SendError::NotConnected
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}")).unwrap();
        let connector = BridgeConnector::new(url, Duration::from_secs(2));
        let result = connector.connect(None).await;
        assert!(matches!(result, Err(SessionError::ConnectFailed { .. })));
    }
}
