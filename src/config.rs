use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::client::ClientBuilder;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub generation: GenerationParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Image generation parameters applied to every request built by the client.
///
/// Defaults: 50 steps, 1 sample, cfg-scale 7.0.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_steps")]
    pub steps: u64,
    #[serde(default = "default_samples")]
    pub samples: u64,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
}

// Defaults
fn default_api_host() -> String { crate::DEFAULT_API_HOST.to_string() }
fn default_engine() -> String { crate::DEFAULT_ENGINE.to_string() }
fn default_steps() -> u64 { 50 }
fn default_samples() -> u64 { 1 }
fn default_cfg_scale() -> f32 { 7.0 }

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            api_key: String::new(),
            engine: default_engine(),
            connect_timeout_secs: None,
            request_timeout_secs: None,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            samples: default_samples(),
            cfg_scale: default_cfg_scale(),
        }
    }
}

/// Load variables from a `.env` file into the process environment.
///
/// Variables already set in the environment are kept. Without `path`, `.env`
/// is looked up from the working directory upwards. A missing file is not an
/// error. Must run before the command line is parsed so `env`-backed flags
/// see the file's values.
pub fn load_env_file(path: Option<&Path>) {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|_| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };

    match loaded {
        Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("Ignoring unreadable .env file: {}", e),
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// An explicit `path` (or `STABILITYAI_CONFIG`) must exist. Otherwise the
    /// usual locations are searched and built-in defaults are used when none
    /// of them exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => env::var("STABILITYAI_CONFIG")
                .map(PathBuf::from)
                .ok()
                .or_else(Self::find_config_file),
        };

        let Some(config_path) = config_path else {
            tracing::debug!("No config file found, using defaults");
            return Ok(Self::default());
        };

        // Validate config file permissions on Unix systems
        #[cfg(unix)]
        Self::validate_file_permissions(&config_path)?;

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::debug!("Loaded config from {}", config_path.display());

        Ok(config)
    }

    /// Parse a TOML document after substituting `${VAR}` references
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let content = Self::substitute_env_vars(content);
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        let mut locations = vec![PathBuf::from("./stabilityai.toml")];
        if let Ok(home) = env::var("HOME") {
            locations.push(Path::new(&home).join(".config/stabilityai/config.toml"));
        }

        locations.into_iter().find(|path| path.exists())
    }

    /// Substitute ${VAR_NAME} with environment variable values.
    ///
    /// Single forward pass: substituted values are copied verbatim and never
    /// scanned again.
    fn substitute_env_vars(content: &str) -> String {
        let mut result = String::with_capacity(content.len());
        let mut rest = content;

        while let Some(start) = rest.find("${") {
            let Some(end) = rest[start..].find('}') else {
                break;
            };
            let var_name = &rest[start + 2..start + end];

            result.push_str(&rest[..start]);
            result.push_str(&env::var(var_name).unwrap_or_default());
            rest = &rest[start + end + 1..];
        }

        result.push_str(rest);
        result
    }

    /// Warn about settings the server is going to reject
    pub fn validate(&self) {
        if self.api.api_key.is_empty() {
            tracing::warn!("No API key configured - requests will be rejected by the server");
        }
        if self.generation.samples == 0 {
            tracing::warn!("generation.samples is 0 - the server will not return any image");
        }
    }

    /// Build a client from this configuration
    pub fn client_builder(&self) -> ClientBuilder {
        let mut builder = ClientBuilder::new()
            .with_api_host(&self.api.host)
            .with_api_key(&self.api.api_key)
            .with_engine(&self.api.engine)
            .with_generation_params(self.generation.clone());

        if let Some(secs) = self.api.connect_timeout_secs {
            builder = builder.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.api.request_timeout_secs {
            builder = builder.with_request_timeout(Duration::from_secs(secs));
        }

        builder
    }

    /// Validate config file permissions (Unix only)
    #[cfg(unix)]
    fn validate_file_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        // Missing files are reported by the read that follows
        if !path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for config file: {}", path.display()))?;

        let mode = metadata.permissions().mode();

        let group_readable = (mode & 0o040) != 0;
        let others_readable = (mode & 0o004) != 0;
        let group_writable = (mode & 0o020) != 0;
        let others_writable = (mode & 0o002) != 0;

        if group_readable || others_readable {
            tracing::warn!(
                "Config file {} has insecure permissions: {:o}",
                path.display(),
                mode & 0o777
            );
            tracing::warn!(
                "   It may contain your API key. Recommended: chmod 600 {}",
                path.display()
            );
        }

        if group_writable || others_writable {
            anyhow::bail!(
                "Config file {} is writable by group or others (mode: {:o}). \
                This is a security risk. Run: chmod 600 {}",
                path.display(),
                mode & 0o777,
                path.display()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: the variable name is unique to this test
        unsafe { env::set_var("STABILITYAI_TEST_KEY", "sk-test") };

        let input = "api_key = \"${STABILITYAI_TEST_KEY}\"";
        let output = Config::substitute_env_vars(input);

        assert_eq!(output, "api_key = \"sk-test\"");

        unsafe { env::remove_var("STABILITYAI_TEST_KEY") };
    }

    #[test]
    fn test_missing_env_var_becomes_empty() {
        let output = Config::substitute_env_vars("key = \"${STABILITYAI_SURELY_UNSET_VAR}\"");
        assert_eq!(output, "key = \"\"");
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        // SAFETY: the variable names are unique to this test
        unsafe {
            env::set_var("STABILITYAI_TEST_SELF_REF", "${STABILITYAI_TEST_SELF_REF}");
            env::set_var("STABILITYAI_TEST_NESTED", "pre-${STABILITYAI_TEST_OTHER}");
            env::set_var("STABILITYAI_TEST_OTHER", "expanded");
        }

        let output = Config::substitute_env_vars(
            "a = \"${STABILITYAI_TEST_SELF_REF}\"\nb = \"${STABILITYAI_TEST_NESTED}\"",
        );
        assert_eq!(
            output,
            "a = \"${STABILITYAI_TEST_SELF_REF}\"\nb = \"pre-${STABILITYAI_TEST_OTHER}\""
        );

        let config = Config::from_toml_str("[api]\napi_key = \"${STABILITYAI_TEST_SELF_REF}\"")
            .unwrap();
        assert_eq!(config.api.api_key, "${STABILITYAI_TEST_SELF_REF}");

        unsafe {
            env::remove_var("STABILITYAI_TEST_SELF_REF");
            env::remove_var("STABILITYAI_TEST_NESTED");
            env::remove_var("STABILITYAI_TEST_OTHER");
        }
    }

    #[test]
    fn test_unterminated_reference_is_kept() {
        let output = Config::substitute_env_vars("prefix ${STABILITYAI_NO_CLOSE");
        assert_eq!(output, "prefix ${STABILITYAI_NO_CLOSE");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();

        assert_eq!(config.api.host, "grpc.stability.ai:443");
        assert_eq!(config.api.engine, "stable-diffusion-v1");
        assert!(config.api.api_key.is_empty());
        assert_eq!(config.generation, GenerationParams::default());
        assert_eq!(config.generation.steps, 50);
        assert_eq!(config.generation.samples, 1);
        assert_eq!(config.generation.cfg_scale, 7.0);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
            [api]
            engine = "stable-diffusion-512-v2-1"
            request_timeout_secs = 120

            [generation]
            steps = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.api.engine, "stable-diffusion-512-v2-1");
        assert_eq!(config.api.host, "grpc.stability.ai:443");
        assert_eq!(config.api.request_timeout_secs, Some(120));
        assert_eq!(config.api.connect_timeout_secs, None);
        assert_eq!(config.generation.steps, 30);
        assert_eq!(config.generation.samples, 1);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[api]\nhost = \"localhost:50051\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        }

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.api.host, "localhost:50051");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");

        assert!(Config::load(Some(&path)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_world_writable_config_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("writable by group or others"));
    }
}
