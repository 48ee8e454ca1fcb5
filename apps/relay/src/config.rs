use std::env;

const DEV_SECRET: &str = "televisit-dev-secret";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub token_secret: String,
    pub token_issuer: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let token_secret = env::var("TELEVISIT_TOKEN_SECRET").unwrap_or_else(|_| {
            tracing::warn!("TELEVISIT_TOKEN_SECRET not set; using the development secret");
            DEV_SECRET.to_string()
        });
        Self {
            port: env::var("TELEVISIT_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            token_secret,
            token_issuer: env::var("TELEVISIT_TOKEN_ISSUER").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            token_secret: DEV_SECRET.to_string(),
            token_issuer: None,
        }
    }
}
