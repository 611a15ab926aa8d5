use acme_lib::{create_p256_key, create_p384_key, create_rsa_key};
use anyhow::{Result, anyhow};
use log::info;
use openssl::{
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    stack::Stack,
    symm::Cipher,
    x509::{X509NameBuilder, X509ReqBuilder, extension::SubjectAlternativeName},
};
use serde::{Deserialize, Serialize};

const DEFAULT_RSA_BITS: u16 = 3072;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyCurve {
    #[serde(rename = "P-256", alias = "p256")]
    P256,
    #[serde(rename = "P-384", alias = "p384")]
    P384,
}

/// Fully resolved certificate key parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Rsa(u16),
    Ecdsa(KeyCurve),
}

/// Validates key algorithm and size/curve parameters.
/// Nothing configured means RSA 3072.
pub fn resolve_key_params(
    key_algorithm: Option<KeyAlgorithm>,
    key_size: Option<u16>,
    key_curve: Option<KeyCurve>,
) -> Result<KeySpec> {
    match key_algorithm {
        None => {
            if key_size.is_some() || key_curve.is_some() {
                return Err(anyhow!(
                    "Key parameters must include algorithm when size/curve is provided"
                ));
            }
            Ok(KeySpec::Rsa(DEFAULT_RSA_BITS))
        }
        Some(KeyAlgorithm::Rsa) => {
            let size = key_size.unwrap_or(DEFAULT_RSA_BITS);
            if !matches!(size, 2048 | 3072 | 4096) {
                return Err(anyhow!(
                    "Unsupported RSA key size {size}. Allowed: 2048, 3072, 4096"
                ));
            }
            if key_curve.is_some() {
                return Err(anyhow!("RSA keys do not accept key_curve"));
            }
            Ok(KeySpec::Rsa(size))
        }
        Some(KeyAlgorithm::Ecdsa) => {
            if key_size.is_some() {
                return Err(anyhow!("ECDSA keys do not accept key_size"));
            }
            let curve = key_curve.ok_or_else(|| anyhow!("ECDSA key_curve is required"))?;
            Ok(KeySpec::Ecdsa(curve))
        }
    }
}

/// Generates an ACME account key: ECDSA P-256 in PKCS#8 PEM.
pub fn generate_account_key() -> Result<String> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| anyhow!("failed to generate account key: {e}"))?;
    info!("[keys] generated new ECDSA P-256 account key");
    Ok(key_pair.serialize_pem())
}

/// Generates a certificate private key, returned as unencrypted PKCS#8 PEM.
pub fn generate_private_key(spec: KeySpec) -> Result<String> {
    let key = match spec {
        KeySpec::Rsa(size) => create_rsa_key(u32::from(size)),
        KeySpec::Ecdsa(KeyCurve::P256) => create_p256_key(),
        KeySpec::Ecdsa(KeyCurve::P384) => create_p384_key(),
    };
    info!("[keys] generated new certificate key ({spec:?})");
    to_pkcs8_pem(&key)
}

/// Parses a PEM private key, decrypting it with `password` when given, and returns
/// it as unencrypted PKCS#8 PEM.
pub fn load_private_key(pem: &[u8], password: Option<&str>) -> Result<String> {
    let key = match password {
        Some(password) => PKey::private_key_from_pem_passphrase(pem, password.as_bytes())
            .map_err(|e| anyhow!("failed to decrypt private key: {e}"))?,
        None => PKey::private_key_from_pem(pem)
            .map_err(|e| anyhow!("failed to parse private key: {e}"))?,
    };
    to_pkcs8_pem(&key)
}

/// Re-encodes a private key as PKCS#8 PEM encrypted with AES-256-CBC.
pub fn encrypt_private_key(pem: &str, password: &str) -> Result<String> {
    let key = PKey::private_key_from_pem(pem.as_bytes())
        .map_err(|e| anyhow!("failed to parse private key: {e}"))?;
    let encrypted = key
        .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), password.as_bytes())
        .map_err(|e| anyhow!("failed to encrypt private key: {e}"))?;
    String::from_utf8(encrypted).map_err(|_| anyhow!("encrypted key PEM contained invalid UTF-8"))
}

/// Builds a PEM CSR signed by `private_key_pem`: the first domain becomes the CN and
/// every domain is listed as a DNS SAN.
pub fn build_csr(private_key_pem: &str, domains: &[String]) -> Result<String> {
    let common_name = domains
        .first()
        .ok_or_else(|| anyhow!("CSR requires at least one domain"))?;
    let key = PKey::private_key_from_pem(private_key_pem.as_bytes())
        .map_err(|e| anyhow!("failed to parse private key: {e}"))?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .map_err(|e| anyhow!("invalid common name {common_name}: {e}"))?;
    let name = name.build();

    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(&key)?;

    let mut san = SubjectAlternativeName::new();
    for domain in domains {
        san.dns(domain);
    }
    let san = san.build(&builder.x509v3_context(None))?;
    let mut extensions = Stack::new()?;
    extensions.push(san)?;
    builder.add_extensions(&extensions)?;
    builder.sign(&key, MessageDigest::sha256())?;

    let pem = builder.build().to_pem()?;
    String::from_utf8(pem).map_err(|_| anyhow!("CSR PEM contained invalid UTF-8"))
}

fn to_pkcs8_pem(key: &PKey<Private>) -> Result<String> {
    let pem = key
        .private_key_to_pem_pkcs8()
        .map_err(|e| anyhow!("failed to serialize private key: {e}"))?;
    String::from_utf8(pem).map_err(|_| anyhow!("private key PEM contained invalid UTF-8"))
}
