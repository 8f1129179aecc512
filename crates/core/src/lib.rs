pub mod audio;
pub mod gesture;
pub mod media;
pub mod mode;
pub mod notice;
pub mod orchestrator;
pub mod sampler;
pub mod state;
#[cfg(test)]
mod testing;
pub mod tools;
pub mod transport;
pub mod tuning;

pub use gesture::{Action, GestureRecognizer, PointerEvent};
pub use mode::{Mode, PromptSet};
pub use notice::Notice;
pub use orchestrator::{SessionHandle, SessionOptions, SessionOrchestrator};
pub use state::{ConnectionStatus, SessionContext, SessionState};
