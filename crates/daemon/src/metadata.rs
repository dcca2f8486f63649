//! Best-effort disc metadata lookup against an ARM-style database.
//!
//! Metadata is decoration, never a gate: every failure mode here, from a
//! refused connection to a 404 to malformed JSON, resolves to `None` and the
//! job proceeds with disc-label naming.

use std::time::Duration;

use crate::adapter::{MetadataLookup, ToolHandle};
use crate::jobs::DiscMetadata;
use ripd_config::MetadataConfig;

/// ARM database client implementing [`MetadataLookup`].
pub struct ArmLookup {
    config: MetadataConfig,
    client: reqwest::Client,
}

impl ArmLookup {
    pub fn new(config: MetadataConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn search_url(&self, hint: &str) -> String {
        format!(
            "{}/api/v1/search/{}",
            self.config.arm_api_url.trim_end_matches('/'),
            hint
        )
    }
}

impl MetadataLookup for ArmLookup {
    fn lookup(&self, hint: &str) -> ToolHandle<Option<DiscMetadata>> {
        let (handle, task) = ToolHandle::pair();

        if !self.config.enabled || hint.is_empty() {
            task.finish(Ok(None));
            return handle;
        }

        let url = self.search_url(hint);
        let client = self.client.clone();
        let hint = hint.to_string();

        tokio::spawn(async move {
            let response = match client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(hint = %hint, error = %e, "Metadata lookup failed");
                    task.finish(Ok(None));
                    return;
                }
            };

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                tracing::debug!(hint = %hint, "Disc not found in metadata database");
                task.finish(Ok(None));
                return;
            }

            if !response.status().is_success() {
                tracing::warn!(hint = %hint, status = %response.status(), "Metadata lookup rejected");
                task.finish(Ok(None));
                return;
            }

            let body: serde_json::Value = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(hint = %hint, error = %e, "Metadata response was not JSON");
                    task.finish(Ok(None));
                    return;
                }
            };

            task.finish(Ok(parse_search_response(&body)));
        });

        handle
    }
}

/// Extract the first search result, if any.
pub(crate) fn parse_search_response(body: &serde_json::Value) -> Option<DiscMetadata> {
    let result = body.get("results")?.as_array()?.first()?;
    let title = result.get("title")?.as_str()?.to_string();

    Some(DiscMetadata {
        title,
        year: parse_year(result.get("year")),
        imdb_id: result
            .get("imdb_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

/// The database serves year as either a number or a string.
fn parse_year(value: Option<&serde_json::Value>) -> Option<u32> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64().map(|y| y as u32),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
