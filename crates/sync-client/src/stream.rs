//! WebSocket change-stream transport.
//!
//! One socket per connection. Every frame read from the socket is forwarded
//! to the sink tagged with the generation the connection was opened with, so
//! the subscriber can drop anything from a superseded socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use huddle_core::errors::Result as CoreResult;
use huddle_core::sync::{
    ChangeEvent, ChangeOp, ChangeStreamConnection, ChangeStreamTransport, Collection,
    StreamFilter, StreamPayload, StreamSignal, StreamSink, SyncRow,
};

use crate::error::Result;
use crate::types::{ClientFrame, ServerFrame};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Builds a [`ChangeEvent`] from a `change` frame. Inserts and updates need
/// a full row; deletes only need enough of it to name the entity.
pub fn parse_change(
    op: ChangeOp,
    table: &str,
    row: Option<Value>,
    filter_match: Option<String>,
) -> Option<ChangeEvent> {
    let Some(collection) = Collection::parse(table) else {
        log::debug!("[Stream] Ignoring change for unknown table {}", table);
        return None;
    };
    let value = row?;

    match SyncRow::from_value(collection, value.clone()) {
        Ok(row) => Some(ChangeEvent {
            op,
            collection,
            entity_id: row.entity_id(),
            row: Some(row),
            filter_match,
        }),
        Err(err) if op == ChangeOp::Delete => {
            let entity_id = partial_entity_id(collection, &value)?;
            log::debug!(
                "[Stream] Delete of {} {} carries a partial row ({})",
                collection,
                entity_id,
                err
            );
            Some(ChangeEvent {
                op,
                collection,
                entity_id,
                row: None,
                filter_match,
            })
        }
        Err(err) => {
            log::warn!("[Stream] Dropping unreadable {} row: {}", collection, err);
            None
        }
    }
}

fn partial_entity_id(collection: Collection, value: &Value) -> Option<String> {
    match collection {
        Collection::Memberships => {
            let conversation_id = value.get("conversation_id")?.as_str()?;
            let actor_id = value.get("actor_id")?.as_str()?;
            Some(format!("{}:{}", conversation_id, actor_id))
        }
        _ => value.get("id")?.as_str().map(str::to_string),
    }
}

/// Decodes one text frame into a payload. `None` for frames the client does
/// not act on.
pub fn decode_frame(text: &str) -> Option<StreamPayload> {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Change {
            op,
            table,
            row,
            filter_match,
        }) => parse_change(op, &table, row, filter_match).map(StreamPayload::Change),
        Ok(ServerFrame::Heartbeat) => Some(StreamPayload::Heartbeat),
        Ok(ServerFrame::Other) => None,
        Err(err) => {
            log::warn!("[Stream] Unreadable frame: {}", err);
            None
        }
    }
}

fn encode(frame: &ClientFrame<'_>) -> Result<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(frame)?))
}

pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// `url` is the stream endpoint, e.g. `wss://api.huddle.chat/realtime/v1`.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim().trim_end_matches('/').to_string(),
        }
    }

    fn url_with_token(&self, token: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}access_token={}",
            self.url,
            separator,
            urlencoding::encode(token)
        )
    }

    async fn open(
        &self,
        token: &str,
        generation: u64,
        filter: StreamFilter,
        sink: StreamSink,
    ) -> Result<WebSocketConnection> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url_with_token(token)).await?;
        let (mut writer, mut reader) = socket.split();
        writer
            .send(encode(&ClientFrame::Subscribe { filter: &filter })?)
            .await?;
        log::info!("[Stream] Connected (generation {})", generation);

        let reader_task = tokio::spawn(async move {
            let reason = loop {
                let Some(message) = reader.next().await else {
                    break "stream ended".to_string();
                };
                let payload = match message {
                    Ok(WsMessage::Text(text)) => decode_frame(&text),
                    Ok(WsMessage::Close(frame)) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Ok(_) => None,
                    Err(err) => break err.to_string(),
                };
                if let Some(payload) = payload {
                    if sink.send(StreamSignal { generation, payload }).is_err() {
                        return;
                    }
                }
            };
            log::debug!("[Stream] Generation {} closed: {}", generation, reason);
            let _ = sink.send(StreamSignal {
                generation,
                payload: StreamPayload::Closed { reason },
            });
        });

        Ok(WebSocketConnection {
            generation,
            writer: Arc::new(Mutex::new(writer)),
            reader_task,
        })
    }
}

#[async_trait]
impl ChangeStreamTransport for WebSocketTransport {
    async fn connect(
        &self,
        token: &str,
        generation: u64,
        filter: StreamFilter,
        sink: StreamSink,
    ) -> CoreResult<Box<dyn ChangeStreamConnection>> {
        let connection = self.open(token, generation, filter, sink).await?;
        Ok(Box::new(connection))
    }
}

pub struct WebSocketConnection {
    generation: u64,
    writer: Arc<Mutex<WsWriter>>,
    reader_task: JoinHandle<()>,
}

impl WebSocketConnection {
    async fn send_frame(&self, frame: ClientFrame<'_>) -> Result<()> {
        let message = encode(&frame)?;
        self.writer.lock().await.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeStreamConnection for WebSocketConnection {
    fn generation(&self) -> u64 {
        self.generation
    }

    async fn set_filter(&self, filter: StreamFilter) -> CoreResult<()> {
        self.send_frame(ClientFrame::Subscribe { filter: &filter })
            .await
            .map_err(Into::into)
    }

    async fn send_heartbeat(&self) -> CoreResult<()> {
        self.send_frame(ClientFrame::Heartbeat)
            .await
            .map_err(Into::into)
    }

    async fn close(&self) {
        self.reader_task.abort();
        let closing = async {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.send(WsMessage::Close(None)).await {
                log::debug!("[Stream] Close frame not delivered: {}", err);
            }
            let _ = writer.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            log::debug!(
                "[Stream] Generation {} did not close within {}ms; dropping it",
                self.generation,
                CLOSE_TIMEOUT.as_millis()
            );
        }
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
