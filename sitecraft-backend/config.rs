use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::types::{ProviderKind, ProviderSettings};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub sandbox: SandboxRuntimeConfig,
    pub provider: ProviderSettings,
    /// Problems found while reading the environment, logged once tracing is up.
    pub warnings: Vec<String>,
}

/// Which execution backend sessions are created on.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxRuntimeConfig {
    Http {
        api_url: String,
        api_key: Option<String>,
    },
    Local {
        root_dir: PathBuf,
    },
}

impl SandboxRuntimeConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            SandboxRuntimeConfig::Http { .. } => ProviderKind::Http,
            SandboxRuntimeConfig::Local { .. } => ProviderKind::Local,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from a variable lookup (as it would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8081);
        let sentry_dsn = get("SENTRY_DSN");
        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let api_url = get("SANDBOX_API_URL");
        let api_key = get("SANDBOX_API_KEY");
        let local_root = get("LOCAL_SANDBOX_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("sitecraft-sandboxes"));

        let mut warnings = Vec::new();
        let sandbox = match (get("SANDBOX_PROVIDER").as_deref(), api_url) {
            (Some("local"), _) | (None, None) => SandboxRuntimeConfig::Local {
                root_dir: local_root,
            },
            (Some("http"), None) => {
                warnings.push("SANDBOX_PROVIDER=http without SANDBOX_API_URL, falling back to local sandboxes".to_string());
                SandboxRuntimeConfig::Local {
                    root_dir: local_root,
                }
            }
            (Some(other), Some(api_url)) if other != "http" => {
                warnings.push(format!("unknown SANDBOX_PROVIDER {other:?}, using http"));
                SandboxRuntimeConfig::Http { api_url, api_key }
            }
            (Some(other), None) => {
                warnings.push(format!("unknown SANDBOX_PROVIDER {other:?}, using local"));
                SandboxRuntimeConfig::Local {
                    root_dir: local_root,
                }
            }
            (_, Some(api_url)) => SandboxRuntimeConfig::Http { api_url, api_key },
        };

        let defaults = ProviderSettings::default();
        let millis = |key: &str, fallback: Duration| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        let provider = ProviderSettings {
            working_directory: get("SANDBOX_WORKDIR").unwrap_or(defaults.working_directory),
            command_timeout: millis("SANDBOX_TIMEOUT_MS", defaults.command_timeout),
            install_timeout: millis("SANDBOX_INSTALL_TIMEOUT_MS", defaults.install_timeout),
            dev_server_port: get("DEV_SERVER_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.dev_server_port),
            preview_host_suffix: get("PREVIEW_HOST_SUFFIX").unwrap_or(defaults.preview_host_suffix),
            template_dir: get("SANDBOX_TEMPLATE_DIR"),
            restart_after_install: get("RESTART_AFTER_INSTALL")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(defaults.restart_after_install),
            dev_server_settle: defaults.dev_server_settle,
        };

        Config {
            port,
            sentry_dsn,
            environment,
            sandbox,
            provider,
            warnings,
        }
    }

    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_config_invalid_port_uses_default() {
        assert_eq!(config(&[("PORT", "not-a-number")]).port, 8081);
    }

    #[test]
    fn test_config_valid_port() {
        assert_eq!(config(&[("PORT", "3000")]).port, 3000);
    }

    #[test]
    fn test_config_empty_sentry_dsn_is_none() {
        assert!(config(&[("SENTRY_DSN", "")]).sentry_dsn.is_none());
    }

    #[test]
    fn test_config_default_environment() {
        assert_eq!(config(&[]).environment, "local");
    }

    #[test]
    fn test_config_defaults_to_local_sandboxes() {
        let cfg = config(&[]);
        assert_eq!(
            cfg.sandbox,
            SandboxRuntimeConfig::Local {
                root_dir: std::env::temp_dir().join("sitecraft-sandboxes")
            }
        );
        assert_eq!(cfg.provider.command_timeout, Duration::from_secs(30));
        assert_eq!(cfg.provider.install_timeout, Duration::from_secs(300));
        assert!(cfg.provider.restart_after_install);
    }

    #[test]
    fn test_config_api_url_selects_http() {
        let cfg = config(&[
            ("SANDBOX_API_URL", "https://exec.example.com"),
            ("SANDBOX_API_KEY", "sk-1"),
        ]);
        assert_eq!(
            cfg.sandbox,
            SandboxRuntimeConfig::Http {
                api_url: "https://exec.example.com".into(),
                api_key: Some("sk-1".into()),
            }
        );
        assert_eq!(cfg.sandbox.kind(), ProviderKind::Http);
    }

    #[test]
    fn test_config_explicit_local_wins_over_api_url() {
        let cfg = config(&[
            ("SANDBOX_PROVIDER", "local"),
            ("SANDBOX_API_URL", "https://exec.example.com"),
        ]);
        assert_eq!(cfg.sandbox.kind(), ProviderKind::Local);
    }

    #[test]
    fn test_config_http_without_url_falls_back() {
        let cfg = config(&[("SANDBOX_PROVIDER", "http")]);
        assert_eq!(cfg.sandbox.kind(), ProviderKind::Local);
        assert_eq!(cfg.warnings.len(), 1);
        assert!(cfg.warnings[0].contains("SANDBOX_API_URL"));
    }

    #[test]
    fn test_config_unknown_provider_is_reported() {
        let cfg = config(&[("SANDBOX_PROVIDER", "docker")]);
        assert_eq!(cfg.sandbox.kind(), ProviderKind::Local);
        assert_eq!(cfg.warnings, vec!["unknown SANDBOX_PROVIDER \"docker\", using local"]);
        assert!(config(&[]).warnings.is_empty());
    }

    #[test]
    fn test_config_timeouts_and_flags() {
        let cfg = config(&[
            ("SANDBOX_TIMEOUT_MS", "1500"),
            ("SANDBOX_INSTALL_TIMEOUT_MS", "60000"),
            ("DEV_SERVER_PORT", "3000"),
            ("RESTART_AFTER_INSTALL", "false"),
            ("SANDBOX_TEMPLATE_DIR", "/opt/template"),
        ]);
        assert_eq!(cfg.provider.command_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.provider.install_timeout, Duration::from_secs(60));
        assert_eq!(cfg.provider.dev_server_port, 3000);
        assert!(!cfg.provider.restart_after_install);
        assert_eq!(cfg.provider.template_dir.as_deref(), Some("/opt/template"));
    }
}
