use anyhow::{Result, anyhow};

use crate::issuance::error::IssuanceError;

pub const CHALLENGE_LABEL: &str = "_acme-challenge";
const WILDCARD_PREFIX: &str = "*.";

/// Where the DNS-01 TXT record for a requested domain lives.
///
/// `base_domain` is always the last two labels of the name. Multi-part public
/// suffixes such as `co.uk` are not recognised: `foo.example.co.uk` decomposes to
/// `("_acme-challenge.foo.example", "co.uk")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsCoordinate {
    pub host_record: String,
    pub base_domain: String,
}

impl DnsCoordinate {
    /// Fully qualified TXT record name, e.g. `_acme-challenge.www.example.com`.
    pub fn record_name(&self) -> String {
        format!("{}.{}", self.host_record, self.base_domain)
    }
}

/// Maps a requested domain (possibly `*.`-prefixed) to its challenge record
/// coordinates. Wildcard and apex names of the same base domain share a record.
pub fn decompose(domain: &str) -> Result<DnsCoordinate, IssuanceError> {
    let effective = domain.strip_prefix(WILDCARD_PREFIX).unwrap_or(domain);
    let labels: Vec<&str> = effective.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(IssuanceError::InvalidDomainFormat {
            domain: domain.to_string(),
        });
    }

    let split_at = labels.len() - 2;
    let base_domain = labels[split_at..].join(".");
    let subdomain_part = labels[..split_at].join(".");

    let host_record = if subdomain_part.is_empty() {
        CHALLENGE_LABEL.to_string()
    } else {
        format!("{CHALLENGE_LABEL}.{subdomain_part}")
    };

    Ok(DnsCoordinate {
        host_record,
        base_domain,
    })
}

/// Strips the wildcard prefix, used for file naming and notification subjects.
pub fn without_wildcard(domain: &str) -> &str {
    domain.strip_prefix(WILDCARD_PREFIX).unwrap_or(domain)
}

pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    let (wildcard, rest) = match trimmed.strip_prefix(WILDCARD_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if rest.is_empty() {
        return Err(anyhow!("domain name is required after wildcard prefix"));
    }
    let ascii =
        idna::domain_to_ascii(rest).map_err(|err| anyhow!("invalid domain name {input}: {err}"))?;
    let ascii = ascii.to_lowercase();
    if wildcard {
        Ok(format!("{WILDCARD_PREFIX}{ascii}"))
    } else {
        Ok(ascii)
    }
}

/// Normalizes a requested domain list. Order is preserved so the first entry stays
/// the certificate's primary identity; later duplicates are dropped.
pub fn normalize_domains(domains: &[String]) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(domains.len());
    for raw in domains {
        let domain = normalize_domain(raw)?;
        if !normalized.contains(&domain) {
            normalized.push(domain);
        }
    }
    if normalized.is_empty() {
        return Err(anyhow!("At least one domain is required"));
    }
    Ok(normalized)
}
