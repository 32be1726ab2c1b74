//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (`PORT` env, default 80)
    pub port: u16,
    /// Directory for the device/room catalog snapshots
    pub data_dir: String,
    /// Scratch directory for the multipart upload fallback
    pub upload_dir: String,
    /// Maximum total WebSocket connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum WebSocket connections per IP address (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ServerConfig {
            host: env::var("BD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "80".to_string())
                .parse()
                .context("Invalid PORT")?,
            data_dir: env::var("BD_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            upload_dir: env::var("BD_UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string()),
            max_connections: env::var("BD_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("Invalid BD_MAX_CONNECTIONS")?,
            max_connections_per_ip: env::var("BD_MAX_CONNECTIONS_PER_IP")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid BD_MAX_CONNECTIONS_PER_IP")?,
            cors_origins: env::var("BD_CORS_ORIGINS").ok(),
        };

        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 80,
            data_dir: "data".to_string(),
            upload_dir: "uploads".to_string(),
            max_connections: 2000,
            max_connections_per_ip: 0,
            cors_origins: None,
        }
    }
}
