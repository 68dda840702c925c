use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub model_tag: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let model_tag =
            std::env::var("STRATUS_MODEL_TAG").unwrap_or_else(|_| "model-default".to_string());

        let log_level = std::env::var("STRATUS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            model_tag,
            log_level,
        })
    }
}
