use std::env;
use anyhow::{Result, Context};
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The address to bind the SMTP listener to
    pub smtp_bind_address: String,

    /// The port to bind the SMTP listener to
    pub smtp_port: u16,

    /// The address to bind the HTTP API to
    pub api_bind_address: String,

    /// The port to bind the HTTP API to
    pub api_port: u16,

    /// Hostname used in the 220 banner, EHLO reply and message ids
    pub hostname: String,

    /// Seconds to retain captured messages; 0 keeps them until deleted
    pub message_ttl: u64,

    /// PEM certificate enabling STARTTLS, together with `tls_key_path`
    pub tls_cert_path: Option<String>,

    /// PEM private key enabling STARTTLS, together with `tls_cert_path`
    pub tls_key_path: Option<String>,

    /// Flat file of `user:password` SMTP credentials; absent means any
    /// credentials are accepted
    pub auth_file: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (optional)
        let _ = dotenv::dotenv();

        let smtp_bind_address = env::var("MAIL_SNARE_BIND_ADDRESS")
            .unwrap_or_else(|_| "0.0.0.0".to_string());

        let smtp_port = env::var("MAIL_SNARE_SMTP_PORT")
            .unwrap_or_else(|_| "1025".to_string()) // Use a non-privileged port by default
            .parse::<u16>()
            .context("MAIL_SNARE_SMTP_PORT must be a valid port number")?;

        let api_bind_address = env::var("MAIL_SNARE_API_BIND_ADDRESS")
            .unwrap_or_else(|_| "0.0.0.0".to_string());

        let api_port = env::var("MAIL_SNARE_API_PORT")
            .unwrap_or_else(|_| "8025".to_string())
            .parse::<u16>()
            .context("MAIL_SNARE_API_PORT must be a valid port number")?;

        let hostname = env::var("MAIL_SNARE_HOSTNAME")
            .unwrap_or_else(|_| "mailsnare.example".to_string());

        let message_ttl = env::var("MAIL_SNARE_MESSAGE_TTL")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u64>()
            .context("MAIL_SNARE_MESSAGE_TTL must be a number of seconds")?;

        let tls_cert_path = env::var("MAIL_SNARE_TLS_CERT").ok();
        let tls_key_path = env::var("MAIL_SNARE_TLS_KEY").ok();
        let auth_file = env::var("MAIL_SNARE_AUTH_FILE").ok();

        Ok(Config {
            smtp_bind_address,
            smtp_port,
            api_bind_address,
            api_port,
            hostname,
            message_ttl,
            tls_cert_path,
            tls_key_path,
            auth_file,
        })
    }
}
