use crate::config::Config;
use crate::types::{
    Blob, ClientContent, ClientMessage, Content, FunctionResponse, RealtimeInput, ServerMessage,
    Setup, ToolResponse,
};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub type ClientTx = mpsc::Sender<ClientMessage>;
type ServerTx = mpsc::Sender<ServerEvent>;

/// Events surfaced by the reader task.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Message(Box<ServerMessage>),
    Closed { reason: Option<String> },
    Error(String),
}

/// A connected Gemini Live session.
///
/// Outgoing messages are queued on a channel drained by a writer task;
/// incoming frames are parsed by a reader task and delivered as
/// [`ServerEvent`]s to whoever took [`GeminiClient::server_events`].
pub struct GeminiClient {
    c_tx: ClientTx,
    s_rx: Option<mpsc::Receiver<ServerEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

/// Opens the websocket and queues `setup` as the first message.
pub async fn connect(config: &Config, setup: Setup, capacity: usize) -> Result<GeminiClient> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(config.endpoint())
        .await
        .context("Failed to connect to Gemini Live websocket")?;
    tracing::info!("Connected to Gemini Live ({})", config.model());

    let (mut write, mut read) = ws_stream.split();
    let (c_tx, mut c_rx) = mpsc::channel::<ClientMessage>(capacity);
    let (s_tx, s_rx): (ServerTx, _) = mpsc::channel(capacity);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = c_rx.recv() => event,
                _ = &mut shutdown_rx => None,
            };
            let Some(event) = event else { break };
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("failed to send message: {}", e);
                        break;
                    }
                }
                Err(e) => tracing::error!("failed to serialize message: {}", e),
            }
        }
        if let Err(e) = write.send(Message::Close(None)).await {
            tracing::debug!("close frame not sent: {}", e);
        }
        let _ = write.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = read.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!("failed to read message: {}", e);
                    let _ = s_tx.send(ServerEvent::Error(e.to_string())).await;
                    return;
                }
            };
            let text = match message {
                Message::Text(text) => text,
                // The service frames JSON as binary as often as text.
                Message::Binary(bin) => match String::from_utf8(bin) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("unexpected non-utf8 binary message: {}", e);
                        continue;
                    }
                },
                Message::Close(reason) => {
                    tracing::info!("connection closed: {:?}", reason);
                    let reason = reason.map(|frame| format!("{} {}", frame.code, frame.reason));
                    let _ = s_tx.send(ServerEvent::Closed { reason }).await;
                    return;
                }
                _ => continue,
            };
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(event) => {
                    if s_tx.send(ServerEvent::Message(Box::new(event))).await.is_err() {
                        tracing::debug!("server event receiver dropped");
                        return;
                    }
                }
                Err(e) => tracing::error!("failed to deserialize message: {}, text=> {:?}", e, text),
            }
        }
        let _ = s_tx.send(ServerEvent::Closed { reason: None }).await;
    });

    let client = GeminiClient {
        c_tx,
        s_rx: Some(s_rx),
        shutdown: Some(shutdown_tx),
        writer: Some(writer),
        reader: Some(reader),
    };
    client.send(ClientMessage::Setup(setup)).await?;
    Ok(client)
}

impl GeminiClient {
    /// Takes the receiver of server events. Only one consumer is supported.
    pub fn server_events(&mut self) -> Result<mpsc::Receiver<ServerEvent>> {
        self.s_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("server_events channel has already been taken"))
    }

    /// A cloneable handle for queueing outgoing messages.
    pub fn sender(&self) -> ClientTx {
        self.c_tx.clone()
    }

    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        self.c_tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("connection writer has stopped"))
    }

    pub async fn send_media(&self, blob: Blob) -> Result<()> {
        self.send(ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![blob],
        }))
        .await
    }

    /// Sends a complete user turn made of one text part.
    pub async fn send_text(&self, text: String) -> Result<()> {
        self.send(ClientMessage::ClientContent(ClientContent {
            turns: vec![Content::text(Some("user"), text)],
            turn_complete: true,
        }))
        .await
    }

    pub async fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()> {
        self.send(ClientMessage::ToolResponse(ToolResponse {
            function_responses: responses,
        }))
        .await
    }

    /// Stops the writer, sends a close frame and waits for both tasks.
    pub async fn close(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(writer) = self.writer.take() {
            writer.await.context("writer task panicked")?;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        Ok(())
    }
}

impl Drop for GeminiClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
