pub mod backends;
pub mod error;
pub mod exec_client;
pub mod file_write;
pub mod local_host;
pub mod paths;
pub mod provider;
pub mod scaffold;
#[cfg(test)]
pub mod testing;
pub mod types;

use std::sync::Arc;

pub use error::SandboxError;
pub use provider::{ProviderFactory, SandboxProvider};
pub use types::*;

use crate::config::{Config, SandboxRuntimeConfig};
use backends::http::HttpProviderFactory;
use backends::local::LocalProviderFactory;
use exec_client::ExecClient;

/// Build the provider factory for the configured backend.
pub fn build_provider_factory(config: &Config) -> Arc<dyn ProviderFactory> {
    match &config.sandbox {
        SandboxRuntimeConfig::Http { api_url, api_key } => {
            tracing::info!(api_url = %api_url, "initializing http sandbox provider");
            let client = ExecClient::new(
                api_url.clone(),
                api_key.clone(),
                config.provider.command_timeout,
            );
            Arc::new(HttpProviderFactory::new(client, config.provider.clone()))
        }
        SandboxRuntimeConfig::Local { root_dir } => {
            tracing::info!(root_dir = %root_dir.display(), "initializing local sandbox provider");
            Arc::new(LocalProviderFactory::new(root_dir.clone(), config.provider.clone()))
        }
    }
}
