//! Flags shared by every subcommand.

use clap::{ArgAction, Args};

use crate::client::ApiSession;
use crate::errors::{Error, Result};

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Console base URL, e.g. https://defense.example.com
    #[arg(long, env = "KEELSCAN_SAAS_URL")]
    pub saas_url: Option<String>,

    /// Organization key
    #[arg(long, env = "KEELSCAN_ORG_KEY")]
    pub org_key: Option<String>,

    /// API access id
    #[arg(long, env = "KEELSCAN_API_ID")]
    pub api_id: Option<String>,

    /// API access key
    #[arg(long, env = "KEELSCAN_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable the progress spinner
    #[arg(long, global = true)]
    pub no_progress: bool,
}

/// Connection settings required by commands that talk to the backend.
#[derive(Debug)]
pub struct ApiConfig {
    pub saas_url: String,
    pub org_key: String,
    pub api_id: String,
    pub api_key: String,
}

impl GlobalArgs {
    pub fn api_config(&self) -> Result<ApiConfig> {
        let require = |value: &Option<String>, flag: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("missing required setting: {flag}")))
        };
        Ok(ApiConfig {
            saas_url: require(&self.saas_url, "--saas-url")?,
            org_key: require(&self.org_key, "--org-key")?,
            api_id: require(&self.api_id, "--api-id")?,
            api_key: require(&self.api_key, "--api-key")?,
        })
    }

    pub fn session(&self) -> Result<(ApiConfig, ApiSession)> {
        let config = self.api_config()?;
        let session = ApiSession::new(&config.api_id, &config.api_key)?;
        Ok((config, session))
    }
}
