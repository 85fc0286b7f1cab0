//! Upstream meter access.
//!
//! The poller only sees [`MeterClient::fetch`]. [`ShellyClient`] implements it
//! for the Shelly Pro 3EM Gen2 RPC API (`/rpc/Shelly.GetStatus`), with optional
//! HTTP Digest authentication.

use std::time::Duration;

use async_trait::async_trait;
use digest_auth::{AuthContext, WwwAuthenticateHeader};
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::snapshot::{PhaseReading, TelemetrySnapshot};

/// Why a telemetry fetch failed. Every kind is transient for the poller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("meter unreachable: {0}")]
    Unreachable(String),
    #[error("meter authentication failed: {0}")]
    AuthFailed(String),
    #[error("malformed meter response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
/// Source of telemetry snapshots.
pub trait MeterClient: Send + Sync {
    /// Fetch one snapshot, or fail.
    async fn fetch(&self) -> Result<TelemetrySnapshot, FetchError>;
}

const STATUS_PATH: &str = "/rpc/Shelly.GetStatus";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ShellySettings {
    /// Base URL of the device, e.g. `http://192.168.1.100`.
    pub url: String,
    /// Index of the `em:<id>` component.
    pub em_id: u32,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
}

/// Shelly Pro 3EM client.
#[derive(Debug)]
pub struct ShellyClient {
    http: reqwest::Client,
    url: String,
    em_id: u32,
    credentials: Option<Credentials>,
    /// Last digest challenge, reused until the device rejects it.
    challenge: Mutex<Option<WwwAuthenticateHeader>>,
}

impl ShellyClient {
    pub fn new(settings: ShellySettings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .build()?;

        Ok(Self {
            http,
            url: format!("{}{STATUS_PATH}", settings.url.trim_end_matches('/')),
            em_id: settings.em_id,
            credentials: settings.credentials,
            challenge: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn respond(
        prompt: &mut WwwAuthenticateHeader,
        credentials: &Credentials,
    ) -> Result<String, FetchError> {
        let context = AuthContext::new(
            credentials.username.as_str(),
            credentials.password.as_str(),
            STATUS_PATH,
        );
        prompt
            .respond(&context)
            .map(|answer| answer.to_header_string())
            .map_err(|err| FetchError::AuthFailed(err.to_string()))
    }

    /// `Authorization` value computed from the cached challenge, if any.
    fn cached_authorization(&self) -> Result<Option<String>, FetchError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        let mut challenge = self.challenge.lock();
        challenge
            .as_mut()
            .map(|prompt| Self::respond(prompt, credentials))
            .transpose()
    }

    /// Answer a fresh challenge and cache it for the following requests.
    fn answer_challenge(&self, header: &str) -> Result<String, FetchError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            FetchError::AuthFailed("device requires credentials, none configured".to_string())
        })?;
        let mut prompt = digest_auth::parse(header)
            .map_err(|err| FetchError::AuthFailed(format!("bad digest challenge: {err}")))?;
        let authorization = Self::respond(&mut prompt, credentials)?;
        *self.challenge.lock() = Some(prompt);
        Ok(authorization)
    }

    async fn get(&self, authorization: Option<String>) -> Result<reqwest::Response, FetchError> {
        let mut request = self.http.get(&self.url);
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        request.send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Unreachable(format!("request to {} timed out", self.url))
            } else {
                FetchError::Unreachable(err.to_string())
            }
        })
    }
}

#[async_trait]
impl MeterClient for ShellyClient {
    async fn fetch(&self) -> Result<TelemetrySnapshot, FetchError> {
        let mut response = self.get(self.cached_authorization()?).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(url = %self.url, "digest challenge received");
            let header = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    FetchError::AuthFailed("401 without WWW-Authenticate header".to_string())
                })?;
            let authorization = self.answer_challenge(&header)?;
            response = self.get(Some(authorization)).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                *self.challenge.lock() = None;
                return Err(FetchError::AuthFailed(
                    "device rejected the configured credentials".to_string(),
                ));
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!(
                "{} answered HTTP {status}",
                self.url
            )));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|err| FetchError::MalformedResponse(err.to_string()))?;
        parse_status(&body, self.em_id)
    }
}

#[derive(Debug, Deserialize)]
struct EmStatus {
    a_voltage: Option<f64>,
    b_voltage: Option<f64>,
    c_voltage: Option<f64>,
    a_current: f64,
    b_current: f64,
    c_current: f64,
    a_act_power: f64,
    b_act_power: f64,
    c_act_power: f64,
    total_act_power: f64,
    a_freq: Option<f64>,
    b_freq: Option<f64>,
    c_freq: Option<f64>,
    total_act: Option<f64>,
    total_act_ret: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EmDataStatus {
    total_act: f64,
    total_act_ret: f64,
}

fn component<'de, T: Deserialize<'de>>(value: &'de Value, key: &str) -> Result<T, FetchError> {
    T::deserialize(value).map_err(|err| FetchError::MalformedResponse(format!("{key}: {err}")))
}

/// Build a snapshot from a `Shelly.GetStatus` response.
pub fn parse_status(status: &Value, em_id: u32) -> Result<TelemetrySnapshot, FetchError> {
    let em_key = format!("em:{em_id}");
    let em: EmStatus = status
        .get(&em_key)
        .ok_or_else(|| FetchError::MalformedResponse(format!("{em_key} missing")))
        .and_then(|value| component(value, &em_key))?;

    let emdata_key = format!("emdata:{em_id}");
    let (imported_energy, exported_energy) = match status.get(&emdata_key) {
        Some(value) => {
            let emdata: EmDataStatus = component(value, &emdata_key)?;
            (emdata.total_act, emdata.total_act_ret)
        }
        None => match (em.total_act, em.total_act_ret) {
            (Some(imported), Some(exported)) => (imported, exported),
            _ => {
                return Err(FetchError::MalformedResponse(format!(
                    "{emdata_key} missing and {em_key} has no energy totals"
                )))
            }
        },
    };

    let frequencies = [em.a_freq, em.b_freq, em.c_freq]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    if frequencies.is_empty() {
        return Err(FetchError::MalformedResponse(format!(
            "{em_key} reports no frequency"
        )));
    }
    let frequency = frequencies.iter().sum::<f64>() / frequencies.len() as f64;

    Ok(TelemetrySnapshot {
        phases: [
            PhaseReading {
                voltage: em.a_voltage,
                current: em.a_current,
                power: em.a_act_power,
            },
            PhaseReading {
                voltage: em.b_voltage,
                current: em.b_current,
                power: em.b_act_power,
            },
            PhaseReading {
                voltage: em.c_voltage,
                current: em.c_current,
                power: em.c_act_power,
            },
        ],
        total_power: em.total_act_power,
        frequency,
        imported_energy,
        exported_energy,
    })
}
