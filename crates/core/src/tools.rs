//! Operations the remote service may invoke, and their acknowledgments.

use crate::mode::Mode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const CHANGE_MODE: &str = "changeMode";
pub const TOGGLE_CAMERA: &str = "toggleCamera";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraAction {
    #[serde(alias = "PAUSE")]
    Pause,
    #[serde(alias = "RESUME")]
    Resume,
}

/// A typed remote invocation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "camelCase")]
pub enum RemoteCall {
    ChangeMode { mode: Mode },
    ToggleCamera { action: CameraAction },
}

#[derive(Debug, thiserror::Error)]
pub enum ToolCallError {
    #[error("unknown function {0:?}")]
    Unknown(String),
    #[error("invalid arguments for {name}: {reason}")]
    InvalidArgs { name: String, reason: String },
}

/// A function call as received from the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

impl ToolInvocation {
    pub fn parse(&self) -> Result<RemoteCall, ToolCallError> {
        if self.name != CHANGE_MODE && self.name != TOGGLE_CAMERA {
            return Err(ToolCallError::Unknown(self.name.clone()));
        }
        let args = if self.args.is_null() {
            json!({})
        } else {
            self.args.clone()
        };
        serde_json::from_value(json!({ "name": self.name, "args": args })).map_err(|e| {
            ToolCallError::InvalidArgs {
                name: self.name.clone(),
                reason: e.to_string(),
            }
        })
    }

    pub fn acknowledge(&self, outcome: &ToolOutcome) -> ToolAck {
        ToolAck {
            id: self.id.clone(),
            name: self.name.clone(),
            result: outcome.message(),
            ok: !matches!(outcome, ToolOutcome::Rejected(_)),
        }
    }
}

/// What applying a [`RemoteCall`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    ModeChanged(Mode),
    ModeUnchanged(Mode),
    CameraPaused,
    CameraAlreadyPaused,
    CameraResumed,
    CameraAlreadyRunning,
    Rejected(String),
}

impl ToolOutcome {
    pub fn message(&self) -> String {
        match self {
            ToolOutcome::ModeChanged(mode) => format!("Switched to {mode} mode"),
            ToolOutcome::ModeUnchanged(mode) => format!("Already in {mode} mode"),
            ToolOutcome::CameraPaused => "Camera paused".to_string(),
            ToolOutcome::CameraAlreadyPaused => "Camera already paused".to_string(),
            ToolOutcome::CameraResumed => "Camera resumed".to_string(),
            ToolOutcome::CameraAlreadyRunning => "Camera already running".to_string(),
            ToolOutcome::Rejected(reason) => reason.clone(),
        }
    }
}

/// Structured result returned to the remote service for one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolAck {
    pub id: Option<String>,
    pub name: String,
    pub result: String,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The operations declared to the remote service on connect.
pub fn declarations() -> Vec<ToolDeclaration> {
    let modes: Vec<String> = Mode::ALL
        .iter()
        .map(|m| m.key().to_ascii_uppercase())
        .collect();
    vec![
        ToolDeclaration {
            name: CHANGE_MODE.to_string(),
            description: "Switch the assistant between navigation, reading and object mode."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "mode": { "type": "STRING", "enum": modes }
                },
                "required": ["mode"]
            }),
        },
        ToolDeclaration {
            name: TOGGLE_CAMERA.to_string(),
            description: "Pause or resume the camera feed and spoken descriptions.".to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "action": { "type": "STRING", "enum": ["pause", "resume"] }
                },
                "required": ["action"]
            }),
        },
    ]
}
