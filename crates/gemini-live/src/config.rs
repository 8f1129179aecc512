use secrecy::{ExposeSecret, SecretString};

pub const BASE_URL: &str = "wss://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
const BIDI_PATH: &str = "ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub struct Config {
    base_url: String,
    api_key: SecretString,
    model: String,
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.config.api_key = api_key;
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.config.model = model.to_string();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            api_key: SecretString::from(String::new()),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Websocket URL with the key appended as a query parameter.
    pub(crate) fn endpoint(&self) -> String {
        format!(
            "{}/{}?key={}",
            self.base_url.trim_end_matches('/'),
            BIDI_PATH,
            self.api_key.expose_secret()
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_key_and_bidi_path() {
        let config = Config::builder()
            .with_base_url("wss://example.test/")
            .with_api_key(SecretString::from("k-123".to_string()))
            .build();
        assert_eq!(
            config.endpoint(),
            "wss://example.test/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key=k-123"
        );
        assert_eq!(config.model(), DEFAULT_MODEL);
    }
}
