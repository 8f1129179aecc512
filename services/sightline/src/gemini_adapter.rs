use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use gemini_live::types::{
    Blob, ClientContent, ClientMessage, Content, FunctionDeclaration, FunctionResponse,
    GenerationConfig, Modality, RealtimeInput, ServerMessage, Setup, SpeechConfig, Tool,
    ToolResponse,
};
use gemini_live::{ClientTx, GeminiClient, ServerEvent};
use serde_json::json;
use sightline_core::Mode;
use sightline_core::tools::{ToolAck, ToolInvocation};
use sightline_core::transport::{
    Connection, InboundMessage, Outbound, SessionConfig, Transport, TransportEvent, TransportLink,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Messages buffered in each direction.
const CHANNEL_CAPACITY: usize = 256;

/// An adapter that implements the session `Transport` trait on top of a Gemini Live websocket.
pub struct GeminiTransport {
    config: gemini_live::Config,
}

impl GeminiTransport {
    pub fn new(config: gemini_live::Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for GeminiTransport {
    async fn open(&self, session: SessionConfig) -> Result<TransportLink> {
        let setup = build_setup(self.config.model(), session);
        let mut client = gemini_live::connect(&self.config, setup, CHANNEL_CAPACITY)
            .await
            .context("Failed to open Gemini Live session")?;
        let server_events = client
            .server_events()
            .context("Failed to get server events channel")?;

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let tasks = vec![
            tokio::spawn(forward_outbound(outbound_rx, client.sender())),
            tokio::spawn(translate_events(server_events, events_tx)),
        ];

        Ok(TransportLink {
            outbound: outbound_tx,
            events: events_rx,
            connection: Box::new(GeminiConnection {
                client: Some(client),
                tasks,
            }),
        })
    }
}

struct GeminiConnection {
    client: Option<GeminiClient>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Connection for GeminiConnection {
    async fn close(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        match self.client.take() {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for GeminiConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Builds the opening `setup` message for a session.
pub fn build_setup(model: &str, session: SessionConfig) -> Setup {
    let function_declarations = session
        .tools
        .into_iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name,
            description: tool.description,
            parameters: tool.parameters,
        })
        .collect::<Vec<_>>();

    Setup {
        model: model.to_string(),
        generation_config: GenerationConfig {
            response_modalities: vec![Modality::Audio],
            speech_config: Some(SpeechConfig::prebuilt(session.voice)),
        },
        system_instruction: Some(Content::text(None, session.instruction)),
        tools: if function_declarations.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations,
            }]
        },
    }
}

/// Converts an outbound session message into its wire form.
pub fn to_client_message(message: Outbound) -> ClientMessage {
    match message {
        Outbound::Audio(chunk) => ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: format!("audio/pcm;rate={}", chunk.sample_rate),
                data: chunk.data,
            }],
        }),
        Outbound::Frame(frame) => ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: "image/jpeg".to_string(),
                data: general_purpose::STANDARD.encode(&frame.jpeg),
            }],
        }),
        Outbound::Text(text) => ClientMessage::ClientContent(ClientContent {
            turns: vec![Content::text(Some("user"), text)],
            turn_complete: true,
        }),
        Outbound::ToolResponse(acks) => ClientMessage::ToolResponse(ToolResponse {
            function_responses: acks.into_iter().map(function_response).collect(),
        }),
    }
}

fn function_response(ack: ToolAck) -> FunctionResponse {
    let response = if ack.ok {
        json!({ "result": ack.result })
    } else {
        json!({ "error": ack.result })
    };
    FunctionResponse {
        id: ack.id.unwrap_or_default(),
        name: ack.name,
        response,
    }
}

/// Translates one server message into session events.
pub fn translate(message: ServerMessage) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(TransportEvent::Open);
    }

    let mut inbound = InboundMessage::default();
    if let Some(content) = message.server_content {
        if let Some(transcription) = content.input_transcription {
            tracing::info!("User said: {:?}", transcription.text);
        }
        if let Some(transcription) = content.output_transcription {
            tracing::info!("AI said: {:?}", transcription.text);
        }
        inbound.interrupted = content.interrupted.unwrap_or(false);
        if let Some(turn) = content.model_turn {
            inbound.audio = turn
                .parts
                .into_iter()
                .filter_map(|part| part.inline_data)
                .filter(|blob| blob.mime_type.starts_with("audio/pcm"))
                .map(|blob| blob.data)
                .collect();
        }
        if content.turn_complete == Some(true) {
            tracing::debug!("Model turn complete");
        }
    }
    if let Some(tool_call) = message.tool_call {
        inbound.tool_calls = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolInvocation {
                id: Some(call.id).filter(|id| !id.is_empty()),
                name: call.name,
                args: call.args,
            })
            .collect();
    }
    if let Some(cancellation) = message.tool_call_cancellation {
        tracing::debug!("Server cancelled tool calls {:?}", cancellation.ids);
    }
    if let Some(go_away) = message.go_away {
        tracing::warn!("Server will close the connection soon (time left: {:?})", go_away.time_left);
    }

    if inbound != InboundMessage::default() {
        events.push(TransportEvent::Message(inbound));
    }
    events
}

/// Wire messages for one outbound message.
///
/// A frame sampled in a different mode than the previous one is preceded by
/// a context note naming the mode. The note does not complete the turn.
pub fn to_client_messages(message: Outbound, frame_mode: &mut Option<Mode>) -> Vec<ClientMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Outbound::Frame(frame) = &message {
        if frame_mode.replace(frame.mode) != Some(frame.mode) {
            messages.push(ClientMessage::ClientContent(ClientContent {
                turns: vec![Content::text(
                    Some("user"),
                    format!("[Camera frames now sampled in {} mode]", frame.mode),
                )],
                turn_complete: false,
            }));
        }
    }
    messages.push(to_client_message(message));
    messages
}

async fn forward_outbound(mut outbound: mpsc::Receiver<Outbound>, client: ClientTx) {
    let mut frame_mode = None;
    while let Some(message) = outbound.recv().await {
        for wire in to_client_messages(message, &mut frame_mode) {
            if client.send(wire).await.is_err() {
                tracing::debug!("Gemini writer stopped, dropping outbound queue");
                return;
            }
        }
    }
}

async fn translate_events(
    mut server_events: mpsc::Receiver<ServerEvent>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(event) = server_events.recv().await {
        let translated = match event {
            ServerEvent::Message(message) => translate(*message),
            ServerEvent::Closed { reason } => vec![TransportEvent::Closed(reason)],
            ServerEvent::Error(e) => vec![TransportEvent::Error(e)],
        };
        for event in translated {
            if events.send(event).await.is_err() {
                tracing::debug!("Session event receiver dropped, stopping adapter task.");
                return;
            }
        }
    }
}
