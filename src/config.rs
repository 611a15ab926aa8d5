use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{decompose, normalize_domains, without_wildcard},
    issuance::{
        error::IssuanceError,
        keys::{KeyAlgorithm, KeyCurve, KeySpec, resolve_key_params},
        orchestrator::PollPolicy,
    },
};

pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Everything one issuance run needs. Loaded once, validated, then read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceConfig {
    #[serde(default)]
    pub acme: AcmeConfig,
    pub domains: Vec<String>,
    pub dns: DnsProviderConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
    #[serde(default)]
    pub contact_email: String,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: default_directory_url(),
            contact_email: String::new(),
        }
    }
}

/// DNS hosting provider used to publish challenge records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum DnsProviderConfig {
    Cloudflare(ApiCredentials),
    Digitalocean(ApiCredentials),
    /// Records only live in process memory; nothing is published.
    Memory,
}

/// API token given inline or through the name of an environment variable.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token_env: Option<String>,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("api_token_env", &self.api_token_env)
            .finish()
    }
}

impl ApiCredentials {
    /// Inline token wins; otherwise the named environment variable must be set.
    pub fn resolve_token(&self, provider: &str) -> Result<String> {
        if self.api_token.is_none() && self.api_token_env.is_none() {
            return Err(anyhow!("{provider} requires api_token or api_token_env"));
        }
        resolve_secret(
            self.api_token.as_deref(),
            self.api_token_env.as_deref(),
            &format!("{provider} token"),
        )
    }
}

fn resolve_secret(inline: Option<&str>, env_var: Option<&str>, label: &str) -> Result<String> {
    if let Some(secret) = inline.map(str::trim).filter(|secret| !secret.is_empty()) {
        return Ok(secret.to_string());
    }
    let var = env_var.ok_or_else(|| anyhow!("no {label} configured"))?;
    let secret =
        std::env::var(var).with_context(|| format!("{label} variable {var} is not set"))?;
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(anyhow!("{label} variable {var} is empty"));
    }
    Ok(secret.to_string())
}

/// Challenge publication and polling timings, in seconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub record_ttl: u32,
    pub settle_delay_secs: u64,
    pub initial_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    /// How long acme-lib waits between order status checks while finalizing.
    pub finalize_poll_millis: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            record_ttl: 600,
            settle_delay_secs: 60,
            initial_delay_secs: 5,
            poll_interval_secs: 5,
            max_attempts: 10,
            finalize_poll_millis: 5000,
        }
    }
}

impl ChallengeConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            record_ttl: self.record_ttl,
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub key_dir: PathBuf,
    pub cert_dir: PathBuf,
    pub account_key_file: String,
    /// File names below default to the first domain with any `*.` removed.
    pub private_key_file: Option<String>,
    pub certificate_file: Option<String>,
    pub chain_file: Option<String>,
    pub algorithm: Option<KeyAlgorithm>,
    pub key_size: Option<u16>,
    pub key_curve: Option<KeyCurve>,
    /// Encrypts both written private keys when set.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Reuse the certificate key on disk instead of generating a new one.
    pub reuse_private_key: bool,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("./keys"),
            cert_dir: PathBuf::from("./certs"),
            account_key_file: "account.key".to_string(),
            private_key_file: None,
            certificate_file: None,
            chain_file: None,
            algorithm: None,
            key_size: None,
            key_curve: None,
            password: None,
            reuse_private_key: false,
        }
    }
}

/// Where a run reads and writes key material and certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub account_key: PathBuf,
    pub private_key: PathBuf,
    pub certificate: PathBuf,
    pub full_chain: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifyConfig {
    /// Report through the log only.
    #[default]
    Log,
    /// POST a JSON summary to the given URL.
    Webhook { url: String },
    /// Mail the summary through an SMTP relay.
    Email(SmtpConfig),
}

/// SMTP relay settings. Port 465 uses implicit TLS, any other port STARTTLS.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Sender address, also the SMTP login.
    pub sender: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    pub recipients: Vec<String>,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("sender", &self.sender)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("recipients", &self.recipients)
            .finish()
    }
}

impl SmtpConfig {
    pub fn resolve_password(&self) -> Result<String> {
        resolve_secret(
            self.password.as_deref(),
            self.password_env.as_deref(),
            "SMTP password",
        )
    }
}

fn default_smtp_port() -> u16 {
    587
}

fn default_directory_url() -> String {
    LETSENCRYPT_STAGING.to_string()
}

impl IssuanceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(raw).context("failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Normalizes the domain list and rejects settings the run cannot work with.
    pub fn validate(&mut self) -> Result<(), IssuanceError> {
        self.domains =
            normalize_domains(&self.domains).map_err(|err| IssuanceError::Config(err.to_string()))?;
        for domain in &self.domains {
            decompose(domain)?;
        }

        let email = self.acme.contact_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(IssuanceError::Config(
                "acme.contact_email must be a valid email address".into(),
            ));
        }
        self.acme.contact_email = email.to_string();

        if !self.acme.directory_url.starts_with("https://")
            && !self.acme.directory_url.starts_with("http://")
        {
            return Err(IssuanceError::Config(format!(
                "acme.directory_url is not an http(s) URL: {}",
                self.acme.directory_url
            )));
        }

        if self.challenge.max_attempts == 0 {
            return Err(IssuanceError::Config(
                "challenge.max_attempts must be at least 1".into(),
            ));
        }
        if self.challenge.record_ttl == 0 {
            return Err(IssuanceError::Config(
                "challenge.record_ttl must be positive".into(),
            ));
        }

        self.key_spec()?;
        if let NotifyConfig::Webhook { url } = &self.notify
            && url.trim().is_empty()
        {
            return Err(IssuanceError::Config("notify.url is required".into()));
        }
        if let NotifyConfig::Email(smtp) = &self.notify {
            if smtp.host.trim().is_empty() {
                return Err(IssuanceError::Config("notify.host is required".into()));
            }
            if !smtp.sender.contains('@') {
                return Err(IssuanceError::Config(
                    "notify.sender must be an email address".into(),
                ));
            }
            if smtp.recipients.is_empty() || smtp.recipients.iter().any(|r| !r.contains('@')) {
                return Err(IssuanceError::Config(
                    "notify.recipients must list at least one email address".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn key_spec(&self) -> Result<KeySpec, IssuanceError> {
        resolve_key_params(self.keys.algorithm, self.keys.key_size, self.keys.key_curve)
            .map_err(|err| IssuanceError::Config(err.to_string()))
    }

    /// Points the run at Let's Encrypt production instead of the configured directory.
    pub fn use_production_directory(&mut self) {
        self.acme.directory_url = LETSENCRYPT_PRODUCTION.to_string();
    }

    /// First requested domain without its wildcard prefix; names files and reports.
    pub fn primary_name(&self) -> &str {
        self.domains
            .first()
            .map(|domain| without_wildcard(domain))
            .unwrap_or_default()
    }

    pub fn paths(&self) -> CertificatePaths {
        let base = self.primary_name();
        let keys = &self.keys;
        let private_key = keys
            .private_key_file
            .clone()
            .unwrap_or_else(|| format!("{base}.key"));
        let certificate = keys
            .certificate_file
            .clone()
            .unwrap_or_else(|| format!("{base}.crt"));
        let chain = keys
            .chain_file
            .clone()
            .unwrap_or_else(|| format!("{base}-chain.crt"));
        CertificatePaths {
            account_key: keys.key_dir.join(&keys.account_key_file),
            private_key: keys.key_dir.join(private_key),
            certificate: keys.cert_dir.join(certificate),
            full_chain: keys.cert_dir.join(chain),
        }
    }

    pub fn key_password(&self) -> Option<&str> {
        self.keys.password.as_deref().filter(|password| !password.is_empty())
    }
}
