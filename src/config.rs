//! HTTP client configuration: the profile model, the `ConfigSources`
//! consumer contract, `${VAR}` substitution, and the profile provider.
//!
//! The layered file loader itself is an external collaborator; this module
//! consumes whatever JSON it hands over. [`StaticConfigSources`] is an
//! in-memory implementation for embedding and tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::env_file::parse_env_file;
use crate::error::{codes, Error};
use crate::proxy::{env_proxy_from_environment, ProxySetting};
use crate::result::ApiResult;

/// TLS method selection, by the names used in configuration files.
///
/// The obsolete SSLv2/SSLv3 names are not accepted; `sslv23` (OpenSSL's
/// "negotiate anything" method) maps to no minimum version, like `tls`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslMethod {
    Tls,
    TlsClient,
    TlsServer,
    Tlsv1,
    Tlsv1Client,
    Tlsv1Server,
    Tlsv11,
    Tlsv11Client,
    Tlsv11Server,
    Tlsv12,
    Tlsv12Client,
    Tlsv12Server,
    Tlsv13,
    Tlsv13Client,
    Tlsv13Server,
    Sslv23,
    Sslv23Client,
    Sslv23Server,
}

impl Default for SslMethod {
    fn default() -> Self {
        SslMethod::Tlsv12Client
    }
}

impl SslMethod {
    /// The minimum TLS version this method implies, if any.
    pub fn min_tls_version(self) -> Option<reqwest::tls::Version> {
        use SslMethod::*;
        match self {
            Tlsv1 | Tlsv1Client | Tlsv1Server => Some(reqwest::tls::Version::TLS_1_0),
            Tlsv11 | Tlsv11Client | Tlsv11Server => Some(reqwest::tls::Version::TLS_1_1),
            Tlsv12 | Tlsv12Client | Tlsv12Server => Some(reqwest::tls::Version::TLS_1_2),
            Tlsv13 | Tlsv13Client | Tlsv13Server => Some(reqwest::tls::Version::TLS_1_3),
            Tls | TlsClient | TlsServer | Sslv23 | Sslv23Client | Sslv23Server => None,
        }
    }
}

/// A trust anchor embedded directly in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateEntry {
    /// PEM or DER content (DER would be base64 in JSON; PEM is typical).
    pub cert_content: String,
    /// `"pem"` or `"der"`.
    pub file_format: String,
}

/// A trust anchor referenced by file path.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateFileEntry {
    /// Path to the certificate file.
    pub cert_path: PathBuf,
    /// `"pem"` or `"der"`.
    pub file_format: String,
}

fn default_true() -> bool {
    true
}

/// One named profile of HTTP client configuration, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpclientConfig {
    /// TLS method selection.
    #[serde(default)]
    pub ssl_method: SslMethod,
    /// Worker threads for the manager's executor; 0 means hardware
    /// concurrency.
    #[serde(default)]
    pub threads_num: usize,
    /// Whether the platform's default trust roots are used.
    #[serde(default = "default_true")]
    pub default_verify_path: bool,
    /// Disables certificate verification. For test environments only.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Directories scanned for additional PEM trust anchors.
    #[serde(default)]
    pub verify_paths: Vec<PathBuf>,
    /// Trust anchors embedded in the config.
    #[serde(default)]
    pub certificates: Vec<CertificateEntry>,
    /// Trust anchors referenced by path.
    #[serde(default)]
    pub certificate_files: Vec<CertificateFileEntry>,
    /// Proxy endpoints for the rotation pool.
    #[serde(default)]
    pub proxy_pool: Vec<ProxySetting>,
}

impl HttpclientConfig {
    /// Drops disabled entries and entries whose credentials still contain
    /// unresolved `${…}` placeholders; attempting proxy auth with a literal
    /// placeholder fails in confusing ways.
    fn sanitize_proxy_pool(&mut self) {
        self.proxy_pool
            .retain(|proxy| !proxy.disabled);
        self.proxy_pool.retain(|proxy| {
            !proxy.username.contains("${") && !proxy.password.contains("${")
        });
    }

    /// The worker-thread count after applying the 0-means-hardware rule and
    /// clamping to hardware concurrency.
    pub fn effective_threads(&self) -> usize {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if self.threads_num == 0 {
            hardware
        } else {
            self.threads_num.min(hardware)
        }
    }

    /// Adds an environment-inherited proxy when this profile has no pool of
    /// its own. Disabled entries are ignored; the entry is flagged
    /// `from_env` so NO_PROXY applies to it.
    pub fn inherit_env_proxy_if_empty(&mut self, mut proxy: ProxySetting) {
        if proxy.disabled {
            return;
        }
        proxy.from_env = true;
        if self.proxy_pool.is_empty() {
            self.proxy_pool.push(proxy);
        }
    }
}

impl Default for HttpclientConfig {
    fn default() -> Self {
        HttpclientConfig {
            ssl_method: SslMethod::default(),
            threads_num: 0,
            default_verify_path: true,
            insecure_skip_verify: false,
            verify_paths: Vec::new(),
            certificates: Vec::new(),
            certificate_files: Vec::new(),
            proxy_pool: Vec::new(),
        }
    }
}

/// Contract of the layered configuration loader this crate consumes.
pub trait ConfigSources: Send + Sync {
    /// The merged JSON document registered under `name`. Missing content is
    /// error 5019.
    fn json_content(&self, name: &str) -> ApiResult<Value>;
    /// Command-line overrides, highest precedence for `${VAR}` expansion.
    fn cli_overrides(&self) -> &BTreeMap<String, String>;
    /// Environment-derived overrides.
    fn env_overrides(&self) -> &BTreeMap<String, String>;
}

/// In-memory [`ConfigSources`] for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticConfigSources {
    documents: HashMap<String, Value>,
    cli_overrides: BTreeMap<String, String>,
    env_overrides: BTreeMap<String, String>,
}

impl StaticConfigSources {
    /// An empty source set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a JSON document under `name`.
    pub fn with_document(mut self, name: impl Into<String>, value: Value) -> Self {
        self.documents.insert(name.into(), value);
        self
    }

    /// Adds a CLI override.
    pub fn with_cli_override(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.cli_overrides.insert(key.into(), value.into());
        self
    }

    /// Adds an environment override.
    pub fn with_env_override(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }
}

impl ConfigSources for StaticConfigSources {
    fn json_content(&self, name: &str) -> ApiResult<Value> {
        self.documents.get(name).cloned().ok_or_else(|| {
            Error::new(
                codes::CONFIG_UNREADABLE,
                format!("Config content not found: {name}"),
            )
        })
    }

    fn cli_overrides(&self) -> &BTreeMap<String, String> {
        &self.cli_overrides
    }

    fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env_overrides
    }
}

/// Key/value properties assembled from `.properties` files with env and CLI
/// overrides layered on top. Construction is single-threaded; afterwards
/// the map is read-only.
#[derive(Debug, Clone, Default)]
pub struct AppProperties {
    /// The merged property map.
    pub properties: BTreeMap<String, String>,
}

impl AppProperties {
    /// An empty property set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads property files in order (later files win), then layers env
    /// overrides, then CLI overrides on top.
    pub fn load(
        paths: &[PathBuf],
        env_overrides: &BTreeMap<String, String>,
        cli_overrides: &BTreeMap<String, String>,
    ) -> ApiResult<Self> {
        let mut properties = BTreeMap::new();
        for path in paths {
            properties.extend(parse_env_file(path)?);
        }
        properties.extend(env_overrides.clone());
        properties.extend(cli_overrides.clone());
        Ok(AppProperties { properties })
    }

    /// Loads a single property file into the map, later keys winning.
    pub fn merge_env_file(&mut self, path: &Path) -> ApiResult<()> {
        self.properties.extend(parse_env_file(path)?);
        Ok(())
    }
}

/// Expands `${VAR}` and `${VAR:-default}` in `input`.
///
/// Lookup precedence: CLI overrides, then the process environment, then the
/// properties map, then the inline default. A pattern that resolves nowhere
/// is left intact.
pub fn replace_env_var(
    input: &str,
    cli_overrides: &BTreeMap<String, String>,
    properties: &BTreeMap<String, String>,
) -> String {
    let mut output = input.to_string();
    let mut pos = 0;
    loop {
        let Some(start) = output[pos..].find("${").map(|offset| pos + offset) else {
            break;
        };
        let Some(end) = output[start + 2..].find('}').map(|offset| start + 2 + offset) else {
            break;
        };

        let token = output[start + 2..end].to_string();
        let (var, default_value) = match token.find(":-") {
            Some(delim) => (&token[..delim], &token[delim + 2..]),
            None => (token.as_str(), ""),
        };

        let replacement = if let Some(value) = cli_overrides.get(var) {
            Some(value.clone())
        } else if let Ok(value) = std::env::var(var) {
            if value.is_empty() {
                None
            } else {
                Some(value)
            }
        } else {
            None
        }
        .or_else(|| properties.get(var).cloned())
        .or_else(|| {
            if default_value.is_empty() {
                None
            } else {
                Some(default_value.to_string())
            }
        });

        match replacement {
            Some(value) => {
                output.replace_range(start..=end, &value);
                pos = start + value.len();
            }
            None => {
                pos = end + 1;
            }
        }
    }
    output
}

/// Walks a JSON document and substitutes `${VAR}` patterns in every string.
pub fn substitute_env_vars(
    value: &mut Value,
    cli_overrides: &BTreeMap<String, String>,
    properties: &BTreeMap<String, String>,
) {
    match value {
        Value::Object(map) => {
            for (_, nested) in map.iter_mut() {
                substitute_env_vars(nested, cli_overrides, properties);
            }
        }
        Value::Array(items) => {
            for nested in items.iter_mut() {
                substitute_env_vars(nested, cli_overrides, properties);
            }
        }
        Value::String(text) => {
            *text = replace_env_var(text, cli_overrides, properties);
        }
        _ => {}
    }
}

const KNOWN_PROFILE_KEYS: [&str; 6] = [
    "threads_num",
    "ssl_method",
    "verify_paths",
    "certificates",
    "certificate_files",
    "proxy_pool",
];

pub(crate) fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Loads named [`HttpclientConfig`] profiles from a `ConfigSources`
/// document, expanding `${VAR}` patterns and inheriting an environment
/// proxy into profiles that have no pool of their own.
#[derive(Debug)]
pub struct HttpClientConfigProvider {
    configs: HashMap<String, HttpclientConfig>,
    ordered_names: Vec<String>,
    default_name: String,
}

impl HttpClientConfigProvider {
    /// Loads the `httpclient_config` document. Fails with 5019 when the
    /// document is missing, 400 when it is malformed, and propagates the
    /// SOCKS rejection from the environment adapter.
    pub fn new(
        app_properties: &AppProperties,
        sources: &dyn ConfigSources,
    ) -> ApiResult<Self> {
        let mut document = sources.json_content("httpclient_config")?;
        substitute_env_vars(
            &mut document,
            sources.cli_overrides(),
            &app_properties.properties,
        );
        let mut provider = Self::parse_configs(document)?;
        provider.inherit_env_proxy_if_enabled(sources)?;
        Ok(provider)
    }

    /// The default profile.
    pub fn get(&self) -> &HttpclientConfig {
        &self.configs[&self.default_name]
    }

    /// A profile by name.
    pub fn get_profile(&self, name: &str) -> ApiResult<&HttpclientConfig> {
        self.configs.get(name).ok_or_else(|| {
            Error::new(
                codes::INVALID_ARGUMENT,
                format!("Unknown httpclient config profile: {name}"),
            )
        })
    }

    /// Profile names in document order.
    pub fn names(&self) -> &[String] {
        &self.ordered_names
    }

    /// The name [`get`](Self::get) resolves to.
    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    fn parse_profile(value: Value) -> ApiResult<HttpclientConfig> {
        let mut config: HttpclientConfig = serde_json::from_value(value).map_err(|err| {
            Error::new(
                codes::INVALID_ARGUMENT,
                format!("Invalid httpclient config: {err}"),
            )
        })?;
        config.sanitize_proxy_pool();
        Ok(config)
    }

    fn parse_configs(document: Value) -> ApiResult<Self> {
        let Value::Object(root) = document else {
            return Err(Error::new(
                codes::INVALID_ARGUMENT,
                "Httpclient config root must be an object (map of profiles).",
            ));
        };

        let mut configs = HashMap::new();
        let mut ordered_names = Vec::new();

        let single_profile = KNOWN_PROFILE_KEYS
            .iter()
            .any(|key| root.contains_key(*key));
        if single_profile {
            configs.insert(
                "default".to_string(),
                Self::parse_profile(Value::Object(root))?,
            );
            ordered_names.push("default".to_string());
        } else {
            for (name, profile) in root {
                if !profile.is_object() {
                    return Err(Error::new(
                        codes::INVALID_ARGUMENT,
                        "Each httpclient config entry must be an object.",
                    ));
                }
                configs.insert(name.clone(), Self::parse_profile(profile)?);
                ordered_names.push(name);
            }
            if configs.is_empty() {
                return Err(Error::new(
                    codes::INVALID_ARGUMENT,
                    "No httpclient configurations provided.",
                ));
            }
        }

        let default_name = if configs.contains_key("default") {
            "default".to_string()
        } else {
            ordered_names[0].clone()
        };

        Ok(HttpClientConfigProvider {
            configs,
            ordered_names,
            default_name,
        })
    }

    fn inherit_env_proxy_if_enabled(&mut self, sources: &dyn ConfigSources) -> ApiResult<()> {
        if sources
            .cli_overrides()
            .get("ignore_env_proxy")
            .is_some_and(|value| is_truthy(value))
        {
            return Ok(());
        }

        let Some(proxy) = env_proxy_from_environment()? else {
            return Ok(());
        };

        let mut applied = 0usize;
        for config in self.configs.values_mut() {
            let was_empty = config.proxy_pool.is_empty();
            config.inherit_env_proxy_if_empty(proxy.clone());
            if was_empty && !config.proxy_pool.is_empty() {
                applied += 1;
            }
        }
        tracing::info!(
            host = %proxy.host,
            port = %proxy.port,
            with_credentials = !proxy.username.is_empty(),
            applied_profiles = applied,
            "detected environment proxy"
        );
        Ok(())
    }
}
