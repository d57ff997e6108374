use crate::dkim::{default_header_keys, Canon, HashAlgo};
use crate::pipeline::SigningFailurePolicy;
use crate::upstream::UpstreamSecurity;
use anyhow::Context;
use rfc5321::SmtpClientTimeouts;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where to obtain PEM encoded key or certificate material.
/// A value that looks like a PEM block is used as-is, anything
/// else is taken to be the path to a file holding the data.
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(from = "String")]
pub enum KeySource {
    File(PathBuf),
    Data(String),
}

impl From<String> for KeySource {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("-----") && trimmed.ends_with("-----") {
            Self::Data(value)
        } else {
            let path = trimmed.lines().next().unwrap_or("").trim();
            Self::File(PathBuf::from(path))
        }
    }
}

// Don't leak inline key material into the logs
impl std::fmt::Debug for KeySource {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::File(path) => fmt.debug_tuple("File").field(path).finish(),
            Self::Data(_) => fmt.write_str("Data(<inline>)"),
        }
    }
}

impl KeySource {
    pub async fn get(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::File(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display())),
            Self::Data(data) => Ok(data.as_bytes().to_vec()),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// host:port to accept client connections on
    #[serde(default)]
    pub listen: Option<String>,

    /// The domain that this proxy serves as; it is announced in
    /// the greeting and written into the trace header
    pub domain: String,

    /// Use implicit TLS on the listener
    #[serde(default)]
    pub secure: bool,

    #[serde(default)]
    pub tls_certificate: Option<KeySource>,
    #[serde(default)]
    pub tls_private_key: Option<KeySource>,

    #[serde(
        default = "ProxyConfig::default_idle_timeout",
        with = "humantime_serde"
    )]
    pub idle_timeout: Duration,

    #[serde(
        default = "ProxyConfig::default_write_timeout",
        with = "humantime_serde"
    )]
    pub write_timeout: Duration,

    #[serde(default = "ProxyConfig::default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[serde(default = "ProxyConfig::default_max_recipients")]
    pub max_recipients: usize,

    /// Permit AUTH over a connection that is not protected by TLS.
    /// Defaults to the opposite of `secure`.
    #[serde(default)]
    pub allow_insecure_auth: Option<bool>,

    /// The list of headers to sign, unless overridden per virtual host
    #[serde(default = "default_header_keys")]
    pub header_keys: Vec<String>,

    #[serde(default)]
    pub signing_failure: SigningFailurePolicy,

    /// Upper bound on how much of a message is held in memory while it is
    /// being signed. Defaults to `max_message_bytes`.
    #[serde(default)]
    pub max_spool_bytes: Option<usize>,

    #[serde(default)]
    pub upstream_timeouts: SmtpClientTimeouts,

    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct VirtualHostConfig {
    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub description: String,

    /// host:port, or the path to a unix domain socket for LMTP
    #[serde(default)]
    pub upstream: String,

    #[serde(default)]
    pub upstream_security: UpstreamSecurity,

    #[serde(default)]
    pub lmtp: bool,

    /// Name to verify the upstream certificate against, and to
    /// present in LHLO. Defaults to the host part of `upstream`.
    #[serde(default)]
    pub upstream_host: Option<String>,

    #[serde(default)]
    pub upstream_insecure_tls: bool,

    /// The name to use in EHLO; defaults to the serving domain
    #[serde(default)]
    pub local_name: Option<String>,

    #[serde(default)]
    pub selector: String,

    #[serde(default)]
    pub private_key: Option<KeySource>,

    #[serde(default)]
    pub header_canonicalization: Canon,

    #[serde(default)]
    pub body_canonicalization: Canon,

    #[serde(default)]
    pub hash: HashAlgo,

    #[serde(default)]
    pub header_keys: Option<Vec<String>>,

    /// Overrides the serving domain in the trace header
    #[serde(default)]
    pub received_by: Option<String>,
}

const CONFIG_FILE_NAME: &str = "smtp-dkim-proxy.toml";

impl ProxyConfig {
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(300)
    }

    fn default_write_timeout() -> Duration {
        Duration::from_secs(60)
    }

    fn default_max_message_bytes() -> usize {
        10_240_000
    }

    fn default_max_recipients() -> usize {
        50
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.domain.trim().is_empty() {
            anyhow::bail!("no serving domain specified");
        }
        Ok(config)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// The locations that are consulted, in order, when no config
    /// file was named on the command line
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![Path::new("/etc/smtp-dkim-proxy").join(CONFIG_FILE_NAME)];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(
                PathBuf::from(home)
                    .join(".smtp-dkim-proxy")
                    .join(CONFIG_FILE_NAME),
            );
        }
        paths.push(PathBuf::from(CONFIG_FILE_NAME));
        paths
    }

    pub fn find_config_file() -> Option<PathBuf> {
        Self::search_paths().into_iter().find(|p| p.is_file())
    }

    pub fn listen_address(&self) -> String {
        match &self.listen {
            Some(listen) => listen.clone(),
            None if self.secure => "0.0.0.0:465".to_string(),
            None => "127.0.0.1:2525".to_string(),
        }
    }

    pub fn allow_insecure_auth(&self) -> bool {
        self.allow_insecure_auth.unwrap_or(!self.secure)
    }

    pub fn spool_limit(&self) -> usize {
        self.max_spool_bytes.unwrap_or(self.max_message_bytes)
    }
}
