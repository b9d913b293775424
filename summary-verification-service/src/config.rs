use crate::error::ConfigError;

pub const DEFAULT_MODEL: &str = "openai/gpt-4.1-mini";
const DEFAULT_PORT: u16 = 3000;

/// Runtime configuration read from the environment
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Absent keys are tolerated at startup; requests then fail with a configuration error.
    pub openrouter_api_key: Option<String>,
    pub model: String,
    pub database_url: Option<String>,
    pub port: u16,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let port = match non_empty("PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                expected: "a TCP port number",
                value: raw,
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            openrouter_api_key: non_empty("OPENROUTER_API_KEY"),
            model: non_empty("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            database_url: non_empty("DATABASE_URL"),
            port,
        })
    }
}
