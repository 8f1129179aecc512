use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Operating persona of the companion. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum Mode {
    Navigation,
    Reading,
    Object,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mode {0:?}, expected navigation, reading or object")]
pub struct ParseModeError(String);

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Navigation, Mode::Reading, Mode::Object];

    /// Lowercase key used in prompt file names and configuration.
    pub fn key(self) -> &'static str {
        match self {
            Mode::Navigation => "navigation",
            Mode::Reading => "reading",
            Mode::Object => "object",
        }
    }

    pub fn next(self) -> Mode {
        let i = Self::ALL.iter().position(|m| *m == self).unwrap_or(0);
        Self::ALL[(i + 1) % Self::ALL.len()]
    }

    pub fn previous(self) -> Mode {
        let i = Self::ALL.iter().position(|m| *m == self).unwrap_or(0);
        Self::ALL[(i + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Mode::Navigation => "Navigation",
            Mode::Reading => "Reading",
            Mode::Object => "Object",
        };
        f.write_str(label)
    }
}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.key().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseModeError(s.to_string()))
    }
}

impl TryFrom<String> for Mode {
    type Error = ParseModeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

const NAVIGATION_PERSONA: &str = "You are a calm guide walking beside a blind user. \
Describe the path ahead, obstacles, steps, doors and traffic in short spoken sentences. \
Give directions relative to the user's body (left, right, ahead, clock positions). \
Speak only when something matters for moving safely, and stay brief.";

const READING_PERSONA: &str = "You read printed and on-screen text aloud for a blind user. \
Read text verbatim in natural reading order. Say when text is cut off or blurry and \
tell the user how to move the camera to capture the rest.";

const OBJECT_PERSONA: &str = "You identify objects for a blind user. Name what is in view, \
its colour, size and position relative to the user, and read any labels on it. \
When asked to find something, guide the user's hand toward it.";

const NAVIGATION_QUERY: &str = "Describe what is directly ahead of me and anything I should avoid.";
const READING_QUERY: &str = "Read the text in front of me.";
const OBJECT_QUERY: &str = "What am I looking at?";

const SAFETY_QUALIFIER: &str = "Safety mode is on: warn immediately about any hazard such as \
vehicles, stairs, drop-offs or moving people before describing anything else.";

const TOOL_GUIDANCE: &str = "If the user asks to switch between navigation, reading or object \
mode, call changeMode. If the user asks to pause or resume the camera, call toggleCamera.";

/// Persona and request texts sent to the remote service, per mode.
#[derive(Debug, Clone)]
pub struct PromptSet {
    personas: HashMap<Mode, String>,
    queries: HashMap<Mode, String>,
    safety: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        let personas = HashMap::from([
            (Mode::Navigation, NAVIGATION_PERSONA.to_string()),
            (Mode::Reading, READING_PERSONA.to_string()),
            (Mode::Object, OBJECT_PERSONA.to_string()),
        ]);
        let queries = HashMap::from([
            (Mode::Navigation, NAVIGATION_QUERY.to_string()),
            (Mode::Reading, READING_QUERY.to_string()),
            (Mode::Object, OBJECT_QUERY.to_string()),
        ]);
        Self {
            personas,
            queries,
            safety: SAFETY_QUALIFIER.to_string(),
        }
    }
}

impl PromptSet {
    /// Replaces built-in texts with entries keyed `<mode>`, `<mode>_query`
    /// and `safety`. Unrecognised keys are ignored.
    pub fn with_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        for mode in Mode::ALL {
            if let Some(text) = overrides.get(mode.key()) {
                self.personas.insert(mode, text.trim().to_string());
            }
            if let Some(text) = overrides.get(&format!("{}_query", mode.key())) {
                self.queries.insert(mode, text.trim().to_string());
            }
        }
        if let Some(text) = overrides.get("safety") {
            self.safety = text.trim().to_string();
        }
        self
    }

    pub fn persona(&self, mode: Mode) -> &str {
        self.personas.get(&mode).map(String::as_str).unwrap_or_default()
    }

    pub fn query(&self, mode: Mode) -> &str {
        self.queries.get(&mode).map(String::as_str).unwrap_or_default()
    }

    /// Instruction supplied when the connection is opened.
    pub fn system_instruction(&self, mode: Mode, safety: bool) -> String {
        let mut text = format!("{}\n\n{}", self.persona(mode), TOOL_GUIDANCE);
        if safety {
            text.push_str("\n\n");
            text.push_str(&self.safety);
        }
        text
    }

    /// Message announcing a persona switch on a live connection.
    pub fn context_message(&self, mode: Mode, safety: bool) -> String {
        let mut text = format!("Switch to {} mode. {}", mode, self.persona(mode));
        if safety {
            text.push(' ');
            text.push_str(&self.safety);
        }
        text
    }

    /// Message sent once per query action.
    pub fn query_message(&self, mode: Mode, safety: bool) -> String {
        let mut text = format!("[{} mode] {}", mode, self.query(mode));
        if safety {
            text.push_str(" Mention hazards first.");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_cycle_in_both_directions() {
        assert_eq!(Mode::Navigation.next(), Mode::Reading);
        assert_eq!(Mode::Object.next(), Mode::Navigation);
        assert_eq!(Mode::Navigation.previous(), Mode::Object);
        assert_eq!(Mode::Reading.previous(), Mode::Navigation);
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("READING".parse::<Mode>().unwrap(), Mode::Reading);
        assert_eq!(" object ".parse::<Mode>().unwrap(), Mode::Object);
        assert!("driving".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_serde_uses_upper_case_names() {
        assert_eq!(serde_json::to_string(&Mode::Navigation).unwrap(), "\"NAVIGATION\"");
        let mode: Mode = serde_json::from_str("\"object\"").unwrap();
        assert_eq!(mode, Mode::Object);
    }

    #[test]
    fn safety_qualifier_is_appended_only_when_enabled() {
        let prompts = PromptSet::default();
        let plain = prompts.context_message(Mode::Reading, false);
        let safe = prompts.context_message(Mode::Reading, true);
        assert!(plain.starts_with("Switch to Reading mode."));
        assert!(!plain.contains("Safety mode is on"));
        assert!(safe.contains("Safety mode is on"));
    }

    #[test]
    fn overrides_replace_matching_entries() {
        let overrides = HashMap::from([
            ("reading".to_string(), "Read slowly.\n".to_string()),
            ("object_query".to_string(), "Name it.".to_string()),
            ("unrelated".to_string(), "ignored".to_string()),
        ]);
        let prompts = PromptSet::default().with_overrides(&overrides);
        assert_eq!(prompts.persona(Mode::Reading), "Read slowly.");
        assert_eq!(prompts.query(Mode::Object), "Name it.");
        assert_eq!(prompts.query(Mode::Reading), READING_QUERY);
    }
}
