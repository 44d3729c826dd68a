//! Nokia Health (formerly Withings) measurements over OAuth 1.0a.
//!
//! Nokia signs with HMAC-SHA1 and expects the `oauth_*` parameters in the
//! query string, on the authorize redirect as well.

use super::oauth1::{
    provider_error, Credentials, OAuth1Client, OAuth1Endpoints, OAuthError, ParamPlacement,
    SignatureMethod,
};
use super::{BloodPressureReading, Readings, WeightReading};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

const ACCOUNT_BASE_URL: &str = "https://developer.health.nokia.com/account";
const API_BASE_URL: &str = "https://api.health.nokia.com";

/// Notification categories (`appli`) we subscribe to.
pub const APPLI_WEIGHT: u8 = 1;
pub const APPLI_BLOOD_PRESSURE: u8 = 4;

const MEASURE_WEIGHT: i64 = 1;
const MEASURE_DIASTOLIC: i64 = 9;
const MEASURE_SYSTOLIC: i64 = 10;
const MEASURE_PULSE: i64 = 11;
/// Category 2 groups are user objectives, not measurements.
const CATEGORY_MEASUREMENT: i64 = 1;

#[derive(Clone)]
pub struct NokiaClient {
    oauth: OAuth1Client,
    api_base: String,
}

/// Result of the access-token leg: the token pair and Nokia's own user id.
#[derive(Debug, Clone)]
pub struct NokiaAccess {
    pub token: Credentials,
    pub user_id: String,
}

impl NokiaClient {
    pub fn new(consumer: Credentials) -> Self {
        Self::with_base_urls(consumer, ACCOUNT_BASE_URL, API_BASE_URL)
    }

    pub fn with_base_urls(consumer: Credentials, account_base: &str, api_base: &str) -> Self {
        let account_base = account_base.trim_end_matches('/');
        let endpoints = OAuth1Endpoints {
            request_token_url: format!("{account_base}/request_token"),
            authorize_url: format!("{account_base}/authorize"),
            access_token_url: format!("{account_base}/access_token"),
        };
        Self {
            oauth: OAuth1Client::new(
                consumer,
                SignatureMethod::HmacSha1,
                endpoints,
                ParamPlacement::Query,
            ),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Start the connect flow; returns the authorize URL and the request token
    /// whose secret the caller must keep until the callback arrives.
    pub async fn get_request_url(
        &self,
        callback_url: &str,
    ) -> Result<(String, Credentials), OAuthError> {
        let request_token = self.oauth.request_token(callback_url).await?;
        let url = self.oauth.authorize_url(&request_token)?;
        Ok((url, request_token))
    }

    pub async fn exchange_token(
        &self,
        request_token: &Credentials,
        verifier: &str,
    ) -> Result<NokiaAccess, OAuthError> {
        let access = self.oauth.access_token(request_token, verifier).await?;
        let user_id = access
            .extra
            .get("userid")
            .cloned()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthError::Malformed("access token response lacks userid".into()))?;
        Ok(NokiaAccess {
            token: access.credentials,
            user_id,
        })
    }

    /// Ask Nokia to call `callback_url` whenever new data of `appli` arrives.
    pub async fn subscribe(
        &self,
        token: &Credentials,
        user_id: &str,
        callback_url: &str,
        appli: u8,
    ) -> Result<(), OAuthError> {
        let params = vec![
            ("action".to_string(), "subscribe".to_string()),
            ("userid".to_string(), user_id.to_string()),
            ("callbackurl".to_string(), callback_url.to_string()),
            ("comment".to_string(), "paula".to_string()),
            ("appli".to_string(), appli.to_string()),
        ];
        let value = self
            .oauth
            .get_json(&format!("{}/notify", self.api_base), &params, token)
            .await?;
        check_status(&value)
    }

    pub async fn fetch_measurements(
        &self,
        token: &Credentials,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Readings, OAuthError> {
        let mut params = vec![
            ("action".to_string(), "getmeas".to_string()),
            ("userid".to_string(), user_id.to_string()),
        ];
        if let Some(since) = since {
            params.push(("startdate".to_string(), since.timestamp().to_string()));
        }
        let value = self
            .oauth
            .get_json(&format!("{}/measure", self.api_base), &params, token)
            .await?;
        check_status(&value)?;
        parse_measure_body(&value)
    }
}

fn check_status(value: &serde_json::Value) -> Result<(), OAuthError> {
    if value.is_null() {
        return Err(OAuthError::Malformed("empty response body".into()));
    }
    match provider_error(value) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
struct MeasureBody {
    #[serde(default)]
    measuregrps: Vec<MeasureGroup>,
}

#[derive(Debug, Deserialize)]
struct MeasureGroup {
    date: i64,
    #[serde(default = "default_category")]
    category: i64,
    #[serde(default)]
    measures: Vec<Measure>,
}

fn default_category() -> i64 {
    CATEGORY_MEASUREMENT
}

#[derive(Debug, Deserialize)]
struct Measure {
    value: i64,
    #[serde(rename = "type")]
    kind: i64,
    unit: i32,
}

impl Measure {
    fn scaled(&self) -> f64 {
        self.value as f64 * 10f64.powi(self.unit)
    }
}

fn parse_measure_body(value: &serde_json::Value) -> Result<Readings, OAuthError> {
    let body = value
        .get("body")
        .ok_or_else(|| OAuthError::Malformed("measure response lacks body".into()))?;
    let body: MeasureBody = serde_json::from_value(body.clone())
        .map_err(|e| OAuthError::Malformed(format!("measure body: {e}")))?;

    let mut readings = Readings::default();
    for group in body
        .measuregrps
        .iter()
        .filter(|g| g.category == CATEGORY_MEASUREMENT)
    {
        let Some(measured_at) = Utc.timestamp_opt(group.date, 0).single() else {
            tracing::warn!("Nokia measure group with invalid date {}", group.date);
            continue;
        };
        let find = |kind: i64| {
            group
                .measures
                .iter()
                .find(|m| m.kind == kind)
                .map(Measure::scaled)
        };

        if let Some(kg) = find(MEASURE_WEIGHT) {
            readings.weight.push(WeightReading { measured_at, kg });
        }
        if let (Some(systolic), Some(diastolic)) = (find(MEASURE_SYSTOLIC), find(MEASURE_DIASTOLIC))
        {
            readings.blood_pressure.push(BloodPressureReading {
                measured_at,
                systolic,
                diastolic,
                pulse: find(MEASURE_PULSE),
            });
        }
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> NokiaClient {
        NokiaClient::with_base_urls(
            Credentials::new("nokia-key", "nokia-secret"),
            &format!("{}/account", server.uri()),
            &server.uri(),
        )
    }

    #[test]
    fn measure_groups_become_readings() {
        let value = serde_json::json!({
            "status": 0,
            "body": {
                "measuregrps": [
                    {
                        "date": 1_500_000_000,
                        "category": 1,
                        "measures": [
                            {"value": 79300, "type": 1, "unit": -3}
                        ]
                    },
                    {
                        "date": 1_500_000_600,
                        "category": 1,
                        "measures": [
                            {"value": 120, "type": 10, "unit": 0},
                            {"value": 80, "type": 9, "unit": 0},
                            {"value": 64, "type": 11, "unit": 0}
                        ]
                    },
                    {
                        "date": 1_500_000_900,
                        "category": 2,
                        "measures": [{"value": 70000, "type": 1, "unit": -3}]
                    }
                ]
            }
        });

        let readings = parse_measure_body(&value).unwrap();
        assert_eq!(readings.weight.len(), 1);
        assert!((readings.weight[0].kg - 79.3).abs() < 1e-9);
        assert_eq!(readings.blood_pressure.len(), 1);
        let bp = &readings.blood_pressure[0];
        assert_eq!(bp.systolic, 120.0);
        assert_eq!(bp.diastolic, 80.0);
        assert_eq!(bp.pulse, Some(64.0));
        assert_eq!(bp.measured_at.timestamp(), 1_500_000_600);
    }

    #[test]
    fn incomplete_blood_pressure_group_is_skipped() {
        let value = serde_json::json!({
            "status": 0,
            "body": {"measuregrps": [
                {"date": 1_500_000_000, "measures": [{"value": 120, "type": 10, "unit": 0}]}
            ]}
        });
        assert!(parse_measure_body(&value).unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_status_is_surfaced_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/measure"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": 342})),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_measurements(&Credentials::new("t", "s"), "77", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::Provider { code: 342, .. }));
    }

    #[tokio::test]
    async fn subscribe_passes_callback_and_appli() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notify"))
            .and(query_param("action", "subscribe"))
            .and(query_param("appli", "4"))
            .and(query_param("callbackurl", "https://paula.example/webhook/nokia/3/4"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": 0})),
            )
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .subscribe(
                &Credentials::new("t", "s"),
                "77",
                "https://paula.example/webhook/nokia/3/4",
                APPLI_BLOOD_PRESSURE,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exchange_token_requires_userid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account/access_token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("oauth_token=a&oauth_token_secret=b"),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .exchange_token(&Credentials::new("r", "rs"), "v")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::Malformed(_)));
    }

    #[tokio::test]
    async fn request_url_is_signed_in_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account/request_token"))
            .and(query_param("oauth_callback", "https://paula.example/cb"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("oauth_token=rk&oauth_token_secret=rs"),
            )
            .mount(&server)
            .await;

        let (url, token) = client(&server)
            .get_request_url("https://paula.example/cb")
            .await
            .unwrap();
        assert_eq!(token, Credentials::new("rk", "rs"));
        assert!(url.starts_with(&format!("{}/account/authorize?", server.uri())));
        assert!(url.contains("oauth_token=rk"));
        assert!(url.contains("oauth_signature="));
    }
}
