//! The seam between the session and a remote streaming service.

use crate::mode::Mode;
use crate::tools::{ToolAck, ToolDeclaration, ToolInvocation};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Everything the remote service needs when a connection is opened.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub instruction: String,
    pub voice: String,
    pub safety_mode: bool,
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Base64 PCM16 little-endian mono.
    pub data: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct FrameChunk {
    pub jpeg: Vec<u8>,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Audio(AudioChunk),
    Frame(FrameChunk),
    Text(String),
    ToolResponse(Vec<ToolAck>),
}

pub type OutboundTx = mpsc::Sender<Outbound>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    /// Base64 PCM16 chunks in arrival order.
    pub audio: Vec<String>,
    pub tool_calls: Vec<ToolInvocation>,
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(InboundMessage),
    Closed(Option<String>),
    Error(String),
}

/// Handle used to shut a connection down.
#[async_trait]
pub trait Connection: Send {
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// An opened connection: an outbound queue, its event stream and a handle.
///
/// The event stream ending counts as a close.
pub struct TransportLink {
    pub outbound: OutboundTx,
    pub events: mpsc::Receiver<TransportEvent>,
    pub connection: Box<dyn Connection>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, config: SessionConfig) -> anyhow::Result<TransportLink>;
}
