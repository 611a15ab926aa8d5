use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{
    DnsRecordProvider, fqdn, http, matches_zone, require_txt, retry::retry_provider_verification,
    retry_with_backoff,
};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const MAX_CREATE_ATTEMPTS: u32 = 3;
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Cloudflare error code for "an identical record already exists".
const DUPLICATE_RECORD_CODE: u32 = 81058;

/// Cloudflare DNS via the v4 REST API. Zones are discovered by base domain and
/// cached for the lifetime of the provider.
pub struct CloudflareProvider {
    api_token: String,
    zone_cache: Mutex<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct CloudflareZone {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct CloudflareZoneListResponse {
    result: Vec<CloudflareZone>,
    success: bool,
}

#[derive(Serialize)]
struct CloudflareDnsRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordResponse {
    result: Option<CloudflareDnsRecordResult>,
    success: bool,
    errors: Option<Vec<CloudflareError>>,
}

#[derive(Deserialize, Clone)]
struct CloudflareDnsRecordResult {
    id: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordListResponse {
    result: Vec<CloudflareDnsRecordResult>,
    success: bool,
}

#[derive(Deserialize)]
struct CloudflareError {
    code: u32,
    message: String,
}

impl CloudflareProvider {
    pub fn new(api_token: String) -> Self {
        Self {
            api_token,
            zone_cache: Mutex::new(HashMap::new()),
        }
    }

    fn format_txt_content(value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.starts_with('"') && trimmed.ends_with('"') {
            trimmed.to_string()
        } else {
            format!("\"{}\"", trimmed.trim_matches('"'))
        }
    }

    fn zone_id(&self, base_domain: &str) -> Result<String> {
        if let Some(zone_id) = self
            .zone_cache
            .lock()
            .map_err(|_| anyhow!("Cloudflare zone cache poisoned"))?
            .get(base_domain)
        {
            return Ok(zone_id.clone());
        }

        let client = http::HttpClient::shared();
        let response = http::bearer(
            client.get(format!("{API_BASE}/zones?name={base_domain}")),
            &self.api_token,
        )
        .send()
        .context("Failed to list Cloudflare zones")?;
        let zone_list: CloudflareZoneListResponse = http::ensure_success("Cloudflare", response)?
            .json()
            .context("Failed to parse Cloudflare zone list response")?;

        if !zone_list.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }

        let zone = zone_list
            .result
            .iter()
            .find(|zone| matches_zone(base_domain, &zone.name))
            .ok_or_else(|| anyhow!("No Cloudflare zone found for domain: {}", base_domain))?;

        debug!("[dns-cloudflare] zone {} resolved to {}", zone.name, zone.id);
        self.zone_cache
            .lock()
            .map_err(|_| anyhow!("Cloudflare zone cache poisoned"))?
            .insert(base_domain.to_string(), zone.id.clone());
        Ok(zone.id.clone())
    }

    fn list_records(
        &self,
        zone_id: &str,
        record_name: &str,
        record_type: &str,
    ) -> Result<Vec<CloudflareDnsRecordResult>> {
        let client = http::HttpClient::shared();
        let response = http::bearer(
            client.get(format!(
                "{API_BASE}/zones/{zone_id}/dns_records?type={record_type}&name={record_name}"
            )),
            &self.api_token,
        )
        .send()
        .context("Failed to list Cloudflare DNS records")?;

        let list_result: CloudflareDnsRecordListResponse =
            http::ensure_success("Cloudflare", response)?
                .json()
                .context("Failed to parse Cloudflare DNS record list")?;

        if !list_result.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }
        Ok(list_result.result)
    }

    fn create_record(&self, zone_id: &str, record: &CloudflareDnsRecord<'_>) -> Result<String> {
        let client = http::HttpClient::shared();
        let response = http::bearer(
            client.post(format!("{API_BASE}/zones/{zone_id}/dns_records")),
            &self.api_token,
        )
        .json(record)
        .send()
        .context("Failed to create Cloudflare DNS record")?;

        let status = response.status();
        let body = response.text().unwrap_or_default();
        let parsed = serde_json::from_str::<CloudflareDnsRecordResponse>(&body).ok();

        if let Some(parsed) = parsed {
            if parsed.success {
                return parsed
                    .result
                    .map(|result| result.id)
                    .ok_or_else(|| anyhow!("Cloudflare API did not return record ID"));
            }
            let errors = parsed.errors.unwrap_or_default();
            if errors.iter().any(|err| err.code == DUPLICATE_RECORD_CODE) {
                return Err(anyhow!("Cloudflare reports an identical record already exists"));
            }
            let error_msg = errors
                .iter()
                .map(|err| format!("{}: {}", err.code, err.message))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(anyhow!("Cloudflare API error: {}", error_msg));
        }
        Err(http::status_error("Cloudflare", status, Some(body)))
    }

    fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record: &CloudflareDnsRecord<'_>,
    ) -> Result<()> {
        let client = http::HttpClient::shared();
        let response = http::bearer(
            client.put(format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}")),
            &self.api_token,
        )
        .json(record)
        .send()
        .context("Failed to update Cloudflare DNS record")?;
        http::ensure_success("Cloudflare", response)?;
        Ok(())
    }

    fn verify_record_content(&self, zone_id: &str, record_id: &str, expected: &str) -> Result<()> {
        retry_provider_verification(
            &format!("record {record_id}"),
            "Cloudflare record verification",
            Duration::from_secs(2),
            Duration::from_millis(300),
            || {
                let client = http::HttpClient::shared();
                let response = http::bearer(
                    client.get(format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}")),
                    &self.api_token,
                )
                .send()
                .context("Failed to fetch Cloudflare DNS record")?;

                if !response.status().is_success() {
                    return Ok(false);
                }
                let check: CloudflareDnsRecordResponse = response
                    .json()
                    .context("Failed to parse Cloudflare DNS record response")?;
                Ok(check
                    .result
                    .and_then(|record| record.content)
                    .is_some_and(|content| content == expected))
            },
        )
    }
}

impl DnsRecordProvider for CloudflareProvider {
    fn id(&self) -> &'static str {
        "cloudflare"
    }

    fn upsert_record(
        &self,
        base_domain: &str,
        host_record: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> Result<String> {
        require_txt("Cloudflare", record_type)?;
        let zone_id = self.zone_id(base_domain)?;
        let name = fqdn(base_domain, host_record);
        let content = Self::format_txt_content(value);
        let record = CloudflareDnsRecord {
            record_type,
            name: &name,
            content: &content,
            ttl,
        };

        let existing = self.list_records(&zone_id, &name, record_type)?;
        if let Some(matching) = existing
            .iter()
            .find(|record| record.content.as_deref() == Some(content.as_str()))
        {
            info!("[dns-cloudflare] {} already carries the expected value", name);
            return Ok(matching.id.clone());
        }

        let record_id = match existing.first() {
            Some(current) => {
                self.update_record(&zone_id, &current.id, &record)?;
                info!("[dns-cloudflare] updated {} (id {})", name, current.id);
                current.id.clone()
            }
            None => {
                let id = retry_with_backoff(
                    || self.create_record(&zone_id, &record),
                    MAX_CREATE_ATTEMPTS,
                    CREATE_RETRY_DELAY,
                )?;
                info!("[dns-cloudflare] created {} (id {})", name, id);
                id
            }
        };

        self.verify_record_content(&zone_id, &record_id, &content)?;
        Ok(record_id)
    }

    fn delete_records(
        &self,
        base_domain: &str,
        host_record: &str,
        record_type: &str,
    ) -> Result<usize> {
        require_txt("Cloudflare", record_type)?;
        let zone_id = self.zone_id(base_domain)?;
        let name = fqdn(base_domain, host_record);
        let records = self.list_records(&zone_id, &name, record_type)?;
        let client = http::HttpClient::shared();

        let mut deleted = 0;
        for record in records {
            let response = http::bearer(
                client.delete(format!("{API_BASE}/zones/{zone_id}/dns_records/{}", record.id)),
                &self.api_token,
            )
            .send()
            .context("Failed to delete Cloudflare DNS record")?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                debug!("[dns-cloudflare] record {} already deleted (404)", record.id);
                continue;
            }
            http::ensure_success("Cloudflare", response)?;
            deleted += 1;
        }
        info!("[dns-cloudflare] deleted {} record(s) at {}", deleted, name);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::CloudflareProvider;

    #[test]
    fn txt_content_is_quoted_once() {
        assert_eq!(CloudflareProvider::format_txt_content("abc"), "\"abc\"");
        assert_eq!(CloudflareProvider::format_txt_content("\"abc\""), "\"abc\"");
        assert_eq!(CloudflareProvider::format_txt_content("  abc "), "\"abc\"");
    }
}
