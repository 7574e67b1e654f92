use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::storage::ConfigRepository;

/// Runtime settings consumed by the core components.
///
/// Built once at startup and handed to each component's constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Listen addresses handed to the transport and control surface
    pub proxy_addr: String,
    pub api_addr: String,

    // Traffic history
    pub history_limit: usize,
    pub memory_capacity: usize,
    pub max_response_size: usize,
    pub default_page_size: usize,

    // Backpressure
    pub write_queue_capacity: usize,
    pub hub_queue_capacity: usize,

    // Interception
    pub breakpoint_timeout_secs: Option<u64>,
    pub mock_cors_headers: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy_addr: ":8000".to_string(),
            api_addr: ":8081".to_string(),
            history_limit: 500,
            memory_capacity: 500,
            max_response_size: 1024 * 1024, // 1MB
            default_page_size: 50,
            write_queue_capacity: 1024,
            hub_queue_capacity: 256,
            breakpoint_timeout_secs: None,
            mock_cors_headers: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let defaults = Settings::default();

        let proxy_addr = env::var("GLANCE_PROXY_ADDR").unwrap_or(defaults.proxy_addr);
        let api_addr = env::var("GLANCE_API_ADDR").unwrap_or(defaults.api_addr);

        let history_limit = env::var("GLANCE_HISTORY_LIMIT")
            .unwrap_or_else(|_| defaults.history_limit.to_string())
            .parse()
            .context("Invalid GLANCE_HISTORY_LIMIT")?;
        let memory_capacity = env::var("GLANCE_MEMORY_CAPACITY")
            .unwrap_or_else(|_| defaults.memory_capacity.to_string())
            .parse()
            .context("Invalid GLANCE_MEMORY_CAPACITY")?;
        let max_response_size = env::var("GLANCE_MAX_RESPONSE_SIZE")
            .unwrap_or_else(|_| defaults.max_response_size.to_string())
            .parse()
            .context("Invalid GLANCE_MAX_RESPONSE_SIZE")?;
        let default_page_size = env::var("GLANCE_DEFAULT_PAGE_SIZE")
            .unwrap_or_else(|_| defaults.default_page_size.to_string())
            .parse()
            .context("Invalid GLANCE_DEFAULT_PAGE_SIZE")?;
        let write_queue_capacity = env::var("GLANCE_WRITE_QUEUE_CAPACITY")
            .unwrap_or_else(|_| defaults.write_queue_capacity.to_string())
            .parse()
            .context("Invalid GLANCE_WRITE_QUEUE_CAPACITY")?;
        let hub_queue_capacity = env::var("GLANCE_HUB_QUEUE_CAPACITY")
            .unwrap_or_else(|_| defaults.hub_queue_capacity.to_string())
            .parse()
            .context("Invalid GLANCE_HUB_QUEUE_CAPACITY")?;

        let breakpoint_timeout_secs = match env::var("GLANCE_BREAKPOINT_TIMEOUT_SECS") {
            Ok(value) if !value.trim().is_empty() => Some(
                value
                    .trim()
                    .parse()
                    .context("Invalid GLANCE_BREAKPOINT_TIMEOUT_SECS")?,
            ),
            _ => None,
        };

        let mock_cors_headers = env::var("GLANCE_MOCK_CORS_HEADERS")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .context("Invalid GLANCE_MOCK_CORS_HEADERS")?;

        let settings = Settings {
            proxy_addr,
            api_addr,
            history_limit,
            memory_capacity,
            max_response_size,
            default_page_size,
            write_queue_capacity,
            hub_queue_capacity,
            breakpoint_timeout_secs,
            mock_cors_headers,
        };
        settings.validate()?;

        if let Some(secs) = settings.breakpoint_timeout_secs {
            tracing::info!(timeout_secs = secs, "Breakpoint expiry enabled");
        }

        Ok(settings)
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.write_queue_capacity == 0 {
            return Err(anyhow::anyhow!("write_queue_capacity must be at least 1"));
        }
        if self.hub_queue_capacity == 0 {
            return Err(anyhow::anyhow!("hub_queue_capacity must be at least 1"));
        }
        if self.default_page_size == 0 {
            return Err(anyhow::anyhow!("default_page_size must be at least 1"));
        }
        if self.breakpoint_timeout_secs == Some(0) {
            return Err(anyhow::anyhow!(
                "breakpoint_timeout_secs must be positive (omit it to disable expiry)"
            ));
        }
        Ok(())
    }

    /// Load persisted settings, falling back to defaults when storage fails
    pub async fn load(repo: &dyn ConfigRepository) -> Self {
        match repo.get_config().await {
            Ok(Some(settings)) => settings,
            Ok(None) => Settings::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load settings, using defaults");
                Settings::default()
            }
        }
    }

    /// Persist settings
    pub async fn save(&self, repo: &dyn ConfigRepository) -> Result<()> {
        self.validate()?;
        repo.save_config(self)
            .await
            .context("Failed to persist settings")
    }

    pub fn breakpoint_timeout(&self) -> Option<Duration> {
        self.breakpoint_timeout_secs.map(Duration::from_secs)
    }
}
