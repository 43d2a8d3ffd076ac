use clap::Parser;

use crate::config::WidgetConfig;

#[derive(Parser, Debug)]
#[command(name = "hangout-cards")]
#[command(version)]
#[command(about = "Join a hangout card game and follow its shared state and channel")]
pub struct Args {
    /// Hangout session id
    #[arg(long)]
    pub session: String,

    /// Person id of the local player
    #[arg(long)]
    pub participant: String,

    /// Display name shown in the roster
    #[arg(long, default_value = "Player")]
    pub name: String,

    /// TOML config file
    #[arg(long, short)]
    pub config: Option<String>,

    /// Override the game API base URL
    #[arg(long)]
    pub api_url: Option<String>,

    /// Override the channel WebSocket URL
    #[arg(long)]
    pub channel_url: Option<String>,

    /// Tracing filter, e.g. `debug` or `hangout_cards=trace`
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Args {
    /// Load the config file (or defaults) and apply command-line overrides.
    pub fn resolve_config(&self) -> Result<WidgetConfig, crate::error::WidgetError> {
        let mut config = match &self.config {
            Some(path) => WidgetConfig::load(path)?,
            None => WidgetConfig::default(),
        };
        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(url) = &self.channel_url {
            config.channel_url = url.clone();
        }
        if let Some(filter) = &self.log_level {
            config.log_filter = filter.clone();
        }
        Ok(config)
    }
}
