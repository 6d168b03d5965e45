use crate::cancel::CancellationToken;
use crate::config::Channel;
use crate::llm::{
    ConnectivityReport, GatewayError, GenerationRequest, LanguageModelProvider, ModelTarget,
    StreamEnd,
};
use crate::settings::NetworkSettings;
use crate::stream::{pump_event_stream, WireShape};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use url::Url;

const PROBE_TEXT: &str = "hi";

/// Talks to the configured channels over HTTPS.
#[derive(Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    request_timeout: Duration,
    generation_timeout: Duration,
}

impl HttpProvider {
    pub fn new(network: &NetworkSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(network.request_timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            request_timeout: network.request_timeout(),
            generation_timeout: network.generation_timeout(),
        })
    }

    async fn send(
        &self,
        target: &ModelTarget,
        url: Url,
        body: Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut builder = self.client.post(url).json(&body).timeout(timeout);
        builder = match target.channel {
            Channel::Google => builder.header("x-goog-api-key", &target.api_key),
            _ => builder.bearer_auth(&target.api_key),
        };
        let response = builder.send().await.map_err(GatewayError::from_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(GatewayError::from_status(status.as_u16(), &text))
    }
}

fn ensure_ready(target: &ModelTarget) -> Result<(), GatewayError> {
    if target.api_key.is_empty() {
        return Err(GatewayError::Configuration("API Key missing".to_string()));
    }
    if target.model_id.is_empty() {
        return Err(GatewayError::Configuration("Missing Model ID".to_string()));
    }
    Ok(())
}

fn endpoint(target: &ModelTarget, suffix: &str) -> Result<Url, GatewayError> {
    let raw = format!("{}/{}", target.base_url, suffix);
    Url::parse(&raw).map_err(|err| {
        GatewayError::Configuration(format!("Invalid base URL {}: {err}", target.base_url))
    })
}

fn generation_call(request: &GenerationRequest) -> Result<(Url, Value), GatewayError> {
    let target = &request.target;
    let (url, mut body) = match target.channel {
        Channel::Google => (
            endpoint(
                target,
                &format!("models/{}:streamGenerateContent?alt=sse", target.model_id),
            )?,
            json!({
                "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
                "contents": [{ "role": "user", "parts": [{ "text": request.user_prompt }] }],
                "generationConfig": { "temperature": request.temperature },
            }),
        ),
        _ => (
            endpoint(target, "chat/completions")?,
            json!({
                "model": target.model_id,
                "messages": [
                    { "role": "system", "content": request.system_prompt },
                    { "role": "user", "content": request.user_prompt },
                ],
                "temperature": request.temperature,
                "stream": true,
            }),
        ),
    };
    target.extra.apply_to(&mut body);
    Ok((url, body))
}

fn probe_call(target: &ModelTarget) -> Result<(Url, Value), GatewayError> {
    match target.channel {
        Channel::Google => Ok((
            endpoint(target, &format!("models/{}:generateContent", target.model_id))?,
            json!({
                "contents": [{ "role": "user", "parts": [{ "text": PROBE_TEXT }] }],
                "generationConfig": { "maxOutputTokens": 1 },
            }),
        )),
        _ => Ok((
            endpoint(target, "chat/completions")?,
            json!({
                "model": target.model_id,
                "messages": [{ "role": "user", "content": PROBE_TEXT }],
                "max_tokens": 5,
                "stream": false,
            }),
        )),
    }
}

fn wire_shape(channel: Channel) -> WireShape {
    match channel {
        Channel::Google => WireShape::GeminiEvents,
        _ => WireShape::ChatCompletions,
    }
}

#[async_trait]
impl LanguageModelProvider for HttpProvider {
    async fn stream_generation(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<StreamEnd, GatewayError> {
        let target = &request.target;
        ensure_ready(target)?;
        let (url, body) = generation_call(request)?;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            response = self.send(target, url, body, self.generation_timeout) => response?,
        };

        pump_event_stream(
            response.bytes_stream(),
            wire_shape(target.channel),
            cancel,
            sink,
            GatewayError::from_reqwest,
        )
        .await
    }

    async fn probe(&self, target: &ModelTarget) -> ConnectivityReport {
        let started = Instant::now();
        let outcome = async {
            ensure_ready(target)?;
            let (url, body) = probe_call(target)?;
            self.send(target, url, body, self.request_timeout).await
        }
        .await;

        match outcome {
            Ok(_) => {
                let message = match target.channel {
                    Channel::Google => "Handshake Successful",
                    _ => "Connect OK",
                };
                let latency = started.elapsed().as_millis() as u64;
                tracing::debug!(channel = %target.label, latency_ms = latency, "probe succeeded");
                ConnectivityReport::online(target, message, latency)
            }
            Err(err) => {
                tracing::debug!(channel = %target.label, reason = err.reason(), error = %err, "probe failed");
                ConnectivityReport::failed(&target.label, &err)
            }
        }
    }
}
