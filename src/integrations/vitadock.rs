//! Medisana Vitadock cloud: blood pressure (tensodata) and scale data.

use super::oauth1::{
    Credentials, OAuth1Client, OAuth1Endpoints, OAuthError, ParamPlacement, SignatureMethod,
    Signer,
};
use super::{BloodPressureReading, Readings, SyncMarks, WeightReading};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde::Deserialize;

const BASE_URL: &str = "https://cloud.vitadock.com";
const PAGE_SIZE: usize = 100;
/// Upper bound on pages per module and fetch, in case `start` is ignored.
const MAX_PAGES: usize = 50;

#[derive(Clone)]
pub struct VitadockClient {
    oauth: OAuth1Client,
    base_url: String,
}

impl VitadockClient {
    pub fn new(application: Credentials) -> Self {
        Self::with_base_url(application, BASE_URL)
    }

    pub fn with_base_url(application: Credentials, base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let endpoints = OAuth1Endpoints {
            request_token_url: format!("{base_url}/auth/unauthorizedaccesses"),
            authorize_url: format!("{base_url}/desiredaccessrights/request"),
            access_token_url: format!("{base_url}/auth/accesses/verify"),
        };
        Self {
            oauth: OAuth1Client::new(
                application,
                SignatureMethod::HmacSha256,
                endpoints,
                ParamPlacement::Header,
            )
            .with_token_method(Method::POST),
            base_url,
        }
    }

    pub fn application_token(&self) -> &str {
        self.oauth.signer().consumer_key()
    }

    /// Signer for checking data pushes from the cloud.
    pub fn signer(&self) -> &Signer {
        self.oauth.signer()
    }

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
    ) -> Result<Credentials, OAuthError> {
        Ok(self
            .oauth
            .access_token(request_token, verifier)
            .await?
            .credentials)
    }

    pub async fn fetch_blood_pressure(
        &self,
        token: &Credentials,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<BloodPressureReading>, OAuthError> {
        let entries: Vec<TensoEntry> = self.fetch_list("tensodata", token, since).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                Some(BloodPressureReading {
                    measured_at: millis_to_utc(e.measurement_date)?,
                    systolic: e.systolic?,
                    diastolic: e.diastolic?,
                    pulse: e.pulse,
                })
            })
            .collect())
    }

    pub async fn fetch_weight(
        &self,
        token: &Credentials,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<WeightReading>, OAuthError> {
        let entries: Vec<ScaleEntry> = self.fetch_list("targetscale", token, since).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                Some(WeightReading {
                    measured_at: millis_to_utc(e.measurement_date)?,
                    kg: e.body_weight?,
                })
            })
            .collect())
    }

    pub async fn fetch_all(
        &self,
        token: &Credentials,
        marks: SyncMarks,
    ) -> Result<Readings, OAuthError> {
        Ok(Readings {
            blood_pressure: self.fetch_blood_pressure(token, marks.blood_pressure).await?,
            weight: self.fetch_weight(token, marks.weight).await?,
        })
    }

    /// Pages through `module` until the cloud returns a short page.
    async fn fetch_list<T: serde::de::DeserializeOwned>(
        &self,
        module: &str,
        token: &Credentials,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<T>, OAuthError> {
        let url = format!("{}/data/{module}", self.base_url);
        let date_since = since.map_or(0, |d| d.timestamp_millis()).to_string();
        let mut entries = Vec::new();

        for page in 0..MAX_PAGES {
            let params = vec![
                ("date_since".to_string(), date_since.clone()),
                ("start".to_string(), (page * PAGE_SIZE).to_string()),
                ("max".to_string(), PAGE_SIZE.to_string()),
            ];
            let value = self.oauth.get_json(&url, &params, token).await?;
            if value.is_null() {
                break;
            }
            let batch: Vec<T> = serde_json::from_value(value)
                .map_err(|e| OAuthError::Malformed(format!("vitadock {module}: {e}")))?;
            let short = batch.len() < PAGE_SIZE;
            entries.extend(batch);
            if short {
                return Ok(entries);
            }
        }
        if entries.len() >= PAGE_SIZE * MAX_PAGES {
            tracing::warn!("Vitadock {module}: stopped after {MAX_PAGES} pages");
        }
        Ok(entries)
    }
}

fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TensoEntry {
    measurement_date: i64,
    systolic: Option<f64>,
    diastolic: Option<f64>,
    pulse: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleEntry {
    measurement_date: i64,
    body_weight: Option<f64>,
}
