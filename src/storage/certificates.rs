//! Certificate and key persistence.
//!
//! Keys and certificates are written to the paths resolved from configuration,
//! each file restricted to the owner on unix. Private keys are optionally
//! encrypted with the shared key password.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use log::info;
use pem::Pem;
use serde::Serialize;
use sha2::{Digest, Sha256};
use x509_parser::{extensions::GeneralName, pem::parse_x509_pem};

use crate::{
    config::CertificatePaths,
    issuance::keys::{encrypt_private_key, load_private_key},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

/// Everything a successful run persists.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub account_key_pem: String,
    pub private_key_pem: String,
    /// Leaf first, followed by intermediates, as returned by the authority.
    pub chain_pem: String,
}

pub trait CertificateStore {
    /// Existing account key as unencrypted PEM, if one was saved before.
    fn load_account_key(&self) -> Result<Option<String>>;
    /// Existing certificate key as unencrypted PEM, if one was saved before.
    fn load_certificate_key(&self) -> Result<Option<String>>;
    /// Writes the bundle and returns the paths written.
    fn save(&self, bundle: &CertificateBundle) -> Result<Vec<PathBuf>>;
}

pub struct FileCertificateStore {
    paths: CertificatePaths,
    password: Option<String>,
}

impl FileCertificateStore {
    pub fn new(paths: CertificatePaths, password: Option<String>) -> Self {
        Self {
            paths,
            password: password.filter(|password| !password.is_empty()),
        }
    }

    fn load_key(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw =
            fs::read(path).with_context(|| format!("failed to read key {}", path.display()))?;
        let pem = load_private_key(&raw, self.password.as_deref())
            .with_context(|| format!("failed to load key {}", path.display()))?;
        info!("[storage] loaded key from {}", path.display());
        Ok(Some(pem))
    }

    fn key_bytes(&self, pem: &str) -> Result<String> {
        match &self.password {
            Some(password) => encrypt_private_key(pem, password),
            None => Ok(pem.to_string()),
        }
    }
}

impl CertificateStore for FileCertificateStore {
    fn load_account_key(&self) -> Result<Option<String>> {
        self.load_key(&self.paths.account_key)
    }

    fn load_certificate_key(&self) -> Result<Option<String>> {
        self.load_key(&self.paths.private_key)
    }

    fn save(&self, bundle: &CertificateBundle) -> Result<Vec<PathBuf>> {
        let (leaf_pem, fullchain_pem) = split_certificate_chain(&bundle.chain_pem)?;
        let account_key = self.key_bytes(&bundle.account_key_pem)?;
        let private_key = self.key_bytes(&bundle.private_key_pem)?;

        let files = [
            (&self.paths.account_key, account_key),
            (&self.paths.private_key, private_key),
            (&self.paths.certificate, leaf_pem),
            (&self.paths.full_chain, fullchain_pem),
        ];
        let mut written = Vec::with_capacity(files.len());
        for (path, content) in files {
            write_secure_file(path, content.as_bytes())?;
            info!("[storage] wrote {}", path.display());
            written.push(path.clone());
        }
        Ok(written)
    }
}

/// Splits a PEM chain into the leaf certificate and the re-encoded full chain.
pub fn split_certificate_chain(chain_pem: &str) -> Result<(String, String)> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|err| anyhow!("failed to parse certificate chain PEM: {err}"))?;
    let cert_blocks: Vec<Pem> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .collect();

    if cert_blocks.is_empty() {
        return Err(anyhow!("no certificate PEM blocks found"));
    }

    let encoded: Vec<String> = cert_blocks.iter().map(pem::encode).collect();
    let leaf = encoded[0].clone();
    let fullchain = encoded.join("");
    Ok((leaf, fullchain))
}

/// Identifying details of an issued leaf certificate.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateSummary {
    pub serial: String,
    pub issuer: String,
    pub subject_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// SHA-256 over the leaf DER, hex encoded.
    pub fingerprint: String,
}

impl CertificateSummary {
    pub fn from_chain(chain_pem: &str) -> Result<Self> {
        let (_, pem_block) = parse_x509_pem(chain_pem.as_bytes())
            .map_err(|e| anyhow!("failed to parse issued certificate PEM: {e}"))?;
        let cert = pem_block.parse_x509().map_err(|e| anyhow!(e.to_string()))?;
        let not_before = Utc
            .timestamp_opt(cert.validity().not_before.timestamp(), 0)
            .single()
            .ok_or_else(|| anyhow!("certificate notBefore out of range"))?;
        let not_after = Utc
            .timestamp_opt(cert.validity().not_after.timestamp(), 0)
            .single()
            .ok_or_else(|| anyhow!("certificate notAfter out of range"))?;
        let fingerprint = {
            let mut hasher = Sha256::new();
            hasher.update(cert.as_raw());
            hex::encode(hasher.finalize())
        };
        let subject_names = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            serial: cert.raw_serial_as_string(),
            issuer: cert.issuer().to_string(),
            subject_names,
            not_before,
            not_after,
            fingerprint,
        })
    }
}

fn write_secure_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    ensure_permissions(path)
}

fn ensure_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        if metadata.permissions().mode() & 0o777 != 0o600 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).with_context(|| {
                format!(
                    "failed to set restrictive permissions on {}",
                    path.display()
                )
            })?;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
