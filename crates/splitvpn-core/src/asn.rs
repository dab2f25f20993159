//! ASN -> prefix lookup client (spec §4.2).
//!
//! Grounded in `wirewarden-daemon::api::fetch_config`'s reqwest request
//! shape: a plain GET against a JSON HTTP API, status-coded into a typed
//! error.

use std::time::Duration;

use ipnetwork::IpNetwork;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use splitvpn_types::{Categorized, ErrorCategory, ResolverValues};

#[derive(Debug, Error)]
pub enum AsnError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("asn upstream returned {status}: {body}")]
    UpstreamError { status: u16, body: String },
    #[error("lookup timed out")]
    Timeout,
}

impl Categorized for AsnError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Dependency
    }
}

#[derive(Debug, Deserialize)]
struct BgpviewResponse {
    data: BgpviewData,
}

#[derive(Debug, Deserialize)]
struct BgpviewData {
    #[serde(default)]
    ipv4_prefixes: Vec<BgpviewPrefix>,
    #[serde(default)]
    ipv6_prefixes: Vec<BgpviewPrefix>,
}

#[derive(Debug, Deserialize)]
struct BgpviewPrefix {
    prefix: String,
}

/// Look up the announced v4/v6 prefixes for `asn` (e.g. `"AS15169"`) via the
/// configured ASN-to-prefix upstream, bounded by `timeout`.
#[tracing::instrument(skip(client))]
pub async fn lookup_prefixes(
    client: &Client,
    asn: &str,
    timeout: Duration,
) -> Result<ResolverValues, AsnError> {
    let numeric = asn.trim_start_matches("AS").trim_start_matches("as");
    let url = format!("https://api.bgpview.io/asn/{numeric}/prefixes");

    let resp = tokio::time::timeout(timeout, client.get(&url).send())
        .await
        .map_err(|_| AsnError::Timeout)??;

    let status = resp.status().as_u16();
    if status != 200 {
        let body = resp.text().await.unwrap_or_default();
        return Err(AsnError::UpstreamError { status, body });
    }

    let parsed: BgpviewResponse = resp.json().await?;
    let mut values = ResolverValues::default();
    for prefix in parsed.data.ipv4_prefixes {
        if let Ok(net) = prefix.prefix.parse::<IpNetwork>() {
            values.insert(net);
        }
    }
    for prefix in parsed.data.ipv6_prefixes {
        if let Ok(net) = prefix.prefix.parse::<IpNetwork>() {
            values.insert(net);
        }
    }
    Ok(values)
}
