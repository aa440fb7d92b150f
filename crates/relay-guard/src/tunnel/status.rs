//! Status oracle: asks an external service whether traffic currently exits
//! through a secure tunnel.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::OracleError;

/// What the oracle observed about the current egress path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Traffic leaves through a tunnel exit.
    pub secure: bool,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub organization: Option<String>,
    /// Hostname of the exit relay, when the oracle knows it.
    pub exit_hostname: Option<String>,
    pub blacklisted: bool,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unknown = "unknown";
        writeln!(f, "IP:           {}", self.ip.as_deref().unwrap_or(unknown))?;
        writeln!(f, "Country:      {}", self.country.as_deref().unwrap_or(unknown))?;
        writeln!(f, "City:         {}", self.city.as_deref().unwrap_or(unknown))?;
        writeln!(f, "Organization: {}", self.organization.as_deref().unwrap_or(unknown))?;
        writeln!(f, "Exit relay:   {}", self.exit_hostname.as_deref().unwrap_or("none"))?;
        writeln!(f, "Blacklisted:  {}", if self.blacklisted { "yes" } else { "no" })?;
        if self.secure {
            write!(f, "Your connection is secure.")
        } else {
            write!(f, "Your connection is NOT secure.")
        }
    }
}

/// Reports on the current egress path.
#[async_trait]
pub trait StatusOracle: Send + Sync {
    async fn check(&self) -> Result<StatusReport, OracleError>;
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(default)]
    mullvad_exit_ip: Option<bool>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    organization: Option<String>,
    #[serde(default)]
    mullvad_exit_ip_hostname: Option<String>,
    #[serde(default)]
    blacklisted: Option<Blacklist>,
}

/// Served either as a bare flag or as a detail object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Blacklist {
    Flag(bool),
    Detail { blacklisted: bool },
}

impl Blacklist {
    fn listed(&self) -> bool {
        match self {
            Blacklist::Flag(listed) => *listed,
            Blacklist::Detail { blacklisted } => *blacklisted,
        }
    }
}

/// Country names the status service reports, mapped to ISO 3166 alpha-2.
const COUNTRY_CODES: &[(&str, &str)] = &[
    ("albania", "AL"),
    ("argentina", "AR"),
    ("australia", "AU"),
    ("austria", "AT"),
    ("belgium", "BE"),
    ("brazil", "BR"),
    ("bulgaria", "BG"),
    ("canada", "CA"),
    ("chile", "CL"),
    ("colombia", "CO"),
    ("croatia", "HR"),
    ("cyprus", "CY"),
    ("czech republic", "CZ"),
    ("czechia", "CZ"),
    ("denmark", "DK"),
    ("estonia", "EE"),
    ("finland", "FI"),
    ("france", "FR"),
    ("germany", "DE"),
    ("greece", "GR"),
    ("hong kong", "HK"),
    ("hungary", "HU"),
    ("indonesia", "ID"),
    ("ireland", "IE"),
    ("israel", "IL"),
    ("italy", "IT"),
    ("japan", "JP"),
    ("latvia", "LV"),
    ("malaysia", "MY"),
    ("mexico", "MX"),
    ("netherlands", "NL"),
    ("new zealand", "NZ"),
    ("nigeria", "NG"),
    ("norway", "NO"),
    ("peru", "PE"),
    ("philippines", "PH"),
    ("poland", "PL"),
    ("portugal", "PT"),
    ("romania", "RO"),
    ("serbia", "RS"),
    ("singapore", "SG"),
    ("slovakia", "SK"),
    ("slovenia", "SI"),
    ("south africa", "ZA"),
    ("spain", "ES"),
    ("sweden", "SE"),
    ("switzerland", "CH"),
    ("thailand", "TH"),
    ("turkey", "TR"),
    ("uk", "GB"),
    ("ukraine", "UA"),
    ("united kingdom", "GB"),
    ("united states", "US"),
    ("usa", "US"),
];

/// Reduce a reported country to its alpha-2 code. Two-letter input is
/// upper-cased, known names are looked up case-insensitively, anything else
/// is kept as reported.
fn normalize_country(country: String) -> String {
    let trimmed = country.trim();
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return trimmed.to_ascii_uppercase();
    }
    COUNTRY_CODES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
        .map(|(_, code)| code.to_string())
        .unwrap_or(country)
}

/// Decode a status document. The tunnel-exit flag is mandatory.
pub fn decode_status(body: &[u8]) -> Result<StatusReport, OracleError> {
    let raw: RawStatus =
        serde_json::from_slice(body).map_err(|e| OracleError::Malformed(e.to_string()))?;

    let secure = raw
        .mullvad_exit_ip
        .ok_or_else(|| OracleError::Malformed("missing mullvad_exit_ip".to_string()))?;

    Ok(StatusReport {
        secure,
        ip: raw.ip,
        country: raw.country.map(normalize_country),
        city: raw.city,
        organization: raw.organization,
        exit_hostname: raw.mullvad_exit_ip_hostname,
        blacklisted: raw.blacklisted.as_ref().is_some_and(Blacklist::listed),
    })
}

/// Oracle backed by the status HTTP endpoint.
#[derive(Clone)]
pub struct HttpStatusOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusOracle {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl StatusOracle for HttpStatusOracle {
    async fn check(&self) -> Result<StatusReport, OracleError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Unavailable(format!("HTTP {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| OracleError::Unavailable(format!("reading body: {e}")))?;

        let report = decode_status(&body)?;
        tracing::debug!(
            secure = report.secure,
            country = ?report.country,
            exit = ?report.exit_hostname,
            "Status oracle answered"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_secure_report_with_detail_blacklist() {
        let body = json!({
            "ip": "185.213.154.70",
            "country": "Sweden",
            "city": "Gothenburg",
            "organization": "M247",
            "mullvad_exit_ip": true,
            "mullvad_exit_ip_hostname": "se-got-wg-001",
            "blacklisted": {"blacklisted": false, "results": []}
        });
        let report = decode_status(&serde_json::to_vec(&body).unwrap()).unwrap();

        assert!(report.secure);
        assert_eq!(report.ip.as_deref(), Some("185.213.154.70"));
        assert_eq!(report.country.as_deref(), Some("SE"));
        assert_eq!(report.exit_hostname.as_deref(), Some("se-got-wg-001"));
        assert!(!report.blacklisted);
    }

    #[test]
    fn test_decodes_flag_blacklist_and_normalizes_country_code() {
        let body = json!({"mullvad_exit_ip": false, "country": "se", "blacklisted": true});
        let report = decode_status(&serde_json::to_vec(&body).unwrap()).unwrap();

        assert!(!report.secure);
        assert_eq!(report.country.as_deref(), Some("SE"));
        assert!(report.blacklisted);
        assert!(report.city.is_none());
    }

    #[test]
    fn test_country_names_map_to_codes() {
        assert_eq!(normalize_country("United States".to_string()), "US");
        assert_eq!(normalize_country("UNITED KINGDOM".to_string()), "GB");
        assert_eq!(normalize_country(" Germany ".to_string()), "DE");
        assert_eq!(normalize_country("Atlantis".to_string()), "Atlantis");
    }

    #[test]
    fn test_missing_exit_flag_is_malformed() {
        let body = json!({"ip": "1.2.3.4", "country": "Sweden"});
        let err = decode_status(&serde_json::to_vec(&body).unwrap()).unwrap_err();
        assert!(matches!(err, OracleError::Malformed(ref m) if m.contains("mullvad_exit_ip")));
    }

    #[test]
    fn test_mistyped_exit_flag_is_malformed() {
        let body = json!({"mullvad_exit_ip": "yes"});
        let err = decode_status(&serde_json::to_vec(&body).unwrap()).unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }

    #[test]
    fn test_display_states_verdict() {
        let report = StatusReport {
            secure: false,
            ip: Some("1.2.3.4".to_string()),
            country: None,
            city: None,
            organization: None,
            exit_hostname: None,
            blacklisted: false,
        };
        let text = report.to_string();
        assert!(text.contains("1.2.3.4"));
        assert!(text.ends_with("NOT secure."));
    }

    #[tokio::test]
    async fn test_http_oracle_round_trip_and_error_status() {
        use std::future::IntoFuture;

        let app = axum::Router::new()
            .route(
                "/json",
                axum::routing::get(|| async {
                    axum::Json(json!({"mullvad_exit_ip": true, "country": "Sweden"}))
                }),
            )
            .route(
                "/broken",
                axum::routing::get(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());

        let client = reqwest::Client::new();
        let ok = HttpStatusOracle::new(client.clone(), format!("http://{addr}/json"));
        assert!(ok.check().await.unwrap().secure);

        let broken = HttpStatusOracle::new(client, format!("http://{addr}/broken"));
        let err = broken.check().await.unwrap_err();
        assert!(matches!(err, OracleError::Unavailable(ref m) if m.contains("500")));
    }
}
