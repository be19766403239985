use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use platecast_contracts::media::{MediaAsset, RenderedImageRef};
use platecast_contracts::providers::{Capability, Credential, ProviderRoute, WireFormat};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::dryrun;
use crate::error::{classify_failure, looks_like_content_policy, ProviderError};
use crate::media::vision_data_uri;
use crate::retry::{thread_sleeper, Sleeper};
use crate::token::TokenIssuer;
use crate::transport::{json_or_error, FormField, HttpCall, HttpReply, HttpTransport, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub system: String,
    pub instruction: String,
    pub asset: &'a MediaAsset,
    pub max_dim: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct SourceImage {
    pub asset: MediaAsset,
    /// 0.0 keeps the composition loose, 1.0 stays close to the source.
    pub strength: f32,
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub size: String,
    pub count: u32,
    pub source: Option<SourceImage>,
}

/// Status of a submitted task on the signed-token provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "submitted" | "queued" | "pending" => Some(Self::Queued),
            "processing" | "running" => Some(Self::Running),
            "succeed" | "succeeded" | "success" => Some(Self::Succeeded),
            "failed" | "fail" | "error" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 60,
        }
    }
}

/// Issues one logical call against a resolved [`ProviderRoute`].
///
/// The client knows payload shapes, not vendors: everything vendor-specific
/// is already folded into the route.
#[derive(Clone)]
pub struct ProviderClient {
    transport: Arc<dyn Transport>,
    poll: PollSettings,
    sleeper: Sleeper,
}

impl ProviderClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            poll: PollSettings::default(),
            sleeper: thread_sleeper(),
        }
    }

    pub fn http() -> Self {
        Self::new(Arc::new(HttpTransport::new()))
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn describe_image(
        &self,
        route: &ProviderRoute,
        request: &VisionRequest<'_>,
    ) -> Result<String, ProviderError> {
        check_route(route, Capability::Vision)?;
        if route.wire == WireFormat::Dryrun {
            return Ok(dryrun::describe(request.asset));
        }
        let messages = json!([
            { "role": "system", "content": request.system },
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": request.instruction },
                    {
                        "type": "image_url",
                        "image_url": { "url": vision_data_uri(request.asset, request.max_dim) }
                    }
                ]
            }
        ]);
        self.chat_completion(route, messages, request.temperature)
    }

    pub fn complete_text(
        &self,
        route: &ProviderRoute,
        request: &TextRequest,
    ) -> Result<String, ProviderError> {
        check_route(route, Capability::Text)?;
        if route.wire == WireFormat::Dryrun {
            return Ok(dryrun::complete(&request.messages));
        }
        let messages = serde_json::to_value(&request.messages)
            .map_err(|err| ProviderError::malformed(&route.provider, err.to_string()))?;
        self.chat_completion(route, messages, request.temperature)
    }

    pub fn generate_image(
        &self,
        route: &ProviderRoute,
        request: &ImageRequest,
    ) -> Result<RenderedImageRef, ProviderError> {
        check_route(route, Capability::Image)?;
        match route.wire {
            WireFormat::Dryrun => dryrun::render(&request.prompt, &request.size),
            WireFormat::OpenAiImageEdits if request.source.is_some() => {
                self.openai_image_edit(route, request)
            }
            WireFormat::OpenAiImages | WireFormat::OpenAiImageEdits => {
                self.openai_image_generation(route, request)
            }
            WireFormat::SignedTask => self.signed_task_generation(route, request),
            WireFormat::OpenAiChat => Err(wire_mismatch(route, Capability::Image)),
        }
    }

    fn chat_completion(
        &self,
        route: &ProviderRoute,
        messages: Value,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let payload = json!({
            "model": route.model,
            "messages": messages,
            "temperature": temperature,
            "stream": false,
        });
        let call = HttpCall::post_json(route.url("chat/completions"), payload, route.timeout);
        let reply = self.send(route, call)?;
        let response = json_or_error(&route.provider, reply)?;
        extract_chat_text(&route.provider, &response)
    }

    fn openai_image_generation(
        &self,
        route: &ProviderRoute,
        request: &ImageRequest,
    ) -> Result<RenderedImageRef, ProviderError> {
        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(route.model));
        payload.insert("prompt".to_string(), json!(request.prompt));
        payload.insert("size".to_string(), json!(request.size));
        payload.insert("n".to_string(), json!(request.count.max(1)));
        if let Some(source) = &request.source {
            payload.insert("image".to_string(), json!(source.asset.data_uri()));
            payload.insert("strength".to_string(), json!(source.strength));
        }
        let call = HttpCall::post_json(
            route.url("images/generations"),
            Value::Object(payload),
            route.timeout,
        );
        let reply = self.send(route, call)?;
        let response = json_or_error(&route.provider, reply)?;
        extract_image_ref(&route.provider, &response)
    }

    fn openai_image_edit(
        &self,
        route: &ProviderRoute,
        request: &ImageRequest,
    ) -> Result<RenderedImageRef, ProviderError> {
        let Some(source) = &request.source else {
            return self.openai_image_generation(route, request);
        };
        let fields = vec![
            FormField::text("model", route.model.clone()),
            FormField::text("prompt", request.prompt.clone()),
            FormField::text("size", request.size.clone()),
            FormField::text("n", request.count.max(1).to_string()),
            FormField::file(
                "image",
                source.asset.bytes().to_vec(),
                source.asset.filename(),
                source.asset.mime_type(),
            ),
        ];
        let call = HttpCall::post_multipart(route.url("images/edits"), fields, route.timeout);
        let reply = self.send(route, call)?;
        let response = json_or_error(&route.provider, reply)?;
        extract_image_ref(&route.provider, &response)
    }

    fn signed_task_generation(
        &self,
        route: &ProviderRoute,
        request: &ImageRequest,
    ) -> Result<RenderedImageRef, ProviderError> {
        let endpoint = route.url("v1/images/generations");
        let mut payload = Map::new();
        payload.insert("model_name".to_string(), json!(route.model));
        payload.insert("prompt".to_string(), json!(request.prompt));
        payload.insert("n".to_string(), json!(request.count.max(1)));
        payload.insert(
            "aspect_ratio".to_string(),
            json!(aspect_ratio_for_size(&request.size)),
        );
        if let Some(source) = &request.source {
            payload.insert(
                "image".to_string(),
                json!(BASE64.encode(source.asset.bytes())),
            );
            payload.insert("image_fidelity".to_string(), json!(source.strength));
        }

        let call = HttpCall::post_json(endpoint.clone(), Value::Object(payload), route.timeout);
        let reply = self.send(route, call)?;
        let submitted = signed_task_payload(&route.provider, json_or_error(&route.provider, reply)?)?;
        let task_id = submitted
            .pointer("/data/task_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProviderError::malformed(&route.provider, "task submission returned no task_id"))?
            .to_string();

        let poll_url = format!("{endpoint}/{task_id}");
        for _ in 0..self.poll.max_attempts {
            (self.sleeper)(self.poll.interval);
            let call = HttpCall::get(poll_url.clone(), route.timeout);
            let polled = match self
                .send(route, call)
                .and_then(|reply| json_or_error(&route.provider, reply))
                .and_then(|value| signed_task_payload(&route.provider, value))
            {
                Ok(value) => value,
                Err(err) if err.is_rate_limited() => continue,
                Err(err) => return Err(err),
            };
            let raw_status = polled
                .pointer("/data/task_status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match TaskStatus::parse(raw_status) {
                Some(TaskStatus::Queued | TaskStatus::Running) => continue,
                Some(TaskStatus::Succeeded) => {
                    let url = polled
                        .pointer("/data/task_result/images")
                        .and_then(Value::as_array)
                        .and_then(|rows| {
                            rows.iter()
                                .filter_map(|row| row.get("url").and_then(Value::as_str))
                                .map(str::trim)
                                .find(|url| !url.is_empty())
                        })
                        .ok_or_else(|| {
                            ProviderError::malformed(
                                &route.provider,
                                format!("task {task_id} succeeded without an image url"),
                            )
                        })?;
                    return Ok(RenderedImageRef::Url(url.to_string()));
                }
                Some(TaskStatus::Failed) => {
                    let message = polled
                        .pointer("/data/task_status_msg")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|value| !value.is_empty())
                        .unwrap_or("no reason given")
                        .to_string();
                    if looks_like_content_policy(&message) {
                        return Err(ProviderError::ContentPolicy {
                            provider: route.provider.clone(),
                            message,
                        });
                    }
                    return Err(ProviderError::TaskFailed {
                        provider: route.provider.clone(),
                        task_id,
                        message,
                    });
                }
                None => {
                    return Err(ProviderError::malformed(
                        &route.provider,
                        format!("task {task_id} reported unknown status '{raw_status}'"),
                    ))
                }
            }
        }
        Err(ProviderError::PollTimeout {
            provider: route.provider.clone(),
            task_id,
            attempts: self.poll.max_attempts,
        })
    }

    /// Attaches credentials and sends. Signed routes get a fresh token per call.
    fn send(
        &self,
        route: &ProviderRoute,
        call: HttpCall,
    ) -> Result<HttpReply, ProviderError> {
        let call = match &route.credential {
            Credential::Bearer(key) => call.bearer(key.trim()),
            Credential::SignedKeyPair {
                access_key,
                secret_key,
            } => {
                let signed = TokenIssuer::new(access_key.as_str(), secret_key.as_str())
                    .issue()
                    .map_err(|err| ProviderError::Signing {
                        provider: route.provider.clone(),
                        message: err.to_string(),
                    })?;
                call.bearer(signed.token)
            }
            Credential::None => call,
        };
        self.transport.send(&route.provider, call)
    }
}

/// Validates a route before any request is built. Every `ProviderClient`
/// call runs this first; the pipeline also runs it before an item starts and
/// ahead of the image stage.
pub fn check_route(route: &ProviderRoute, capability: Capability) -> Result<(), ProviderError> {
    if route.wire == WireFormat::Dryrun {
        return Ok(());
    }
    let wire_fits = match capability {
        Capability::Vision | Capability::Text => route.wire == WireFormat::OpenAiChat,
        Capability::Image => matches!(
            route.wire,
            WireFormat::OpenAiImages | WireFormat::OpenAiImageEdits | WireFormat::SignedTask
        ),
    };
    if !wire_fits {
        return Err(wire_mismatch(route, capability));
    }
    if route.endpoint.is_empty() {
        return Err(ProviderError::config(
            &route.provider,
            format!("{capability} endpoint is empty"),
        ));
    }
    if route.model.trim().is_empty() {
        return Err(ProviderError::config(
            &route.provider,
            format!("{capability} model is empty"),
        ));
    }
    let credential_fits = match (&route.credential, route.wire) {
        (Credential::SignedKeyPair { .. }, WireFormat::SignedTask) => true,
        (Credential::Bearer(_), wire) => wire != WireFormat::SignedTask,
        _ => false,
    };
    if !route.credential.is_complete() || !credential_fits {
        return Err(ProviderError::config(
            &route.provider,
            format!("{capability} credential is missing or incomplete"),
        ));
    }
    Ok(())
}

fn wire_mismatch(route: &ProviderRoute, capability: Capability) -> ProviderError {
    ProviderError::config(
        &route.provider,
        format!("wire format '{}' cannot serve {capability}", route.wire.as_str()),
    )
}

fn extract_chat_text(provider: &str, response: &Value) -> Result<String, ProviderError> {
    let choice = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .ok_or_else(|| ProviderError::malformed(provider, "response has no choices"))?;
    if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Err(ProviderError::ContentPolicy {
            provider: provider.to_string(),
            message: "completion stopped by content filter".to_string(),
        });
    }
    let content = choice.pointer("/message/content");
    let text = match content {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect::<Vec<&str>>()
            .join("\n"),
        _ => String::new(),
    };
    if text.is_empty() {
        return Err(ProviderError::malformed(provider, "message content is empty"));
    }
    Ok(text)
}

fn extract_image_ref(provider: &str, response: &Value) -> Result<RenderedImageRef, ProviderError> {
    let rows = response
        .get("data")
        .and_then(Value::as_array)
        .into_iter()
        .chain(response.get("images").and_then(Value::as_array))
        .flatten();
    for row in rows {
        if let Some(url) = row
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Ok(RenderedImageRef::Url(url.to_string()));
        }
        if let Some(encoded) = row.get("b64_json").and_then(Value::as_str) {
            let bytes = BASE64.decode(encoded.trim()).map_err(|err| {
                ProviderError::malformed(provider, format!("b64_json is not base64: {err}"))
            })?;
            return Ok(RenderedImageRef::Inline {
                mime_type: "image/png".to_string(),
                bytes,
            });
        }
    }
    Err(ProviderError::malformed(provider, "response contains no image"))
}

/// The signed-task API reports errors in a `code` field even on HTTP 200.
fn signed_task_payload(provider: &str, payload: Value) -> Result<Value, ProviderError> {
    let code = payload.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(payload);
    }
    let body = payload.to_string();
    let err = match code {
        1000..=1004 => classify_failure(provider, 401, &body),
        1301 => ProviderError::ContentPolicy {
            provider: provider.to_string(),
            message: crate::error::provider_message(&body),
        },
        1302 | 1303 => classify_failure(provider, 429, &body),
        _ => classify_failure(provider, 400, &body),
    };
    Err(err)
}

/// Nearest aspect ratio the task API accepts for a `WxH` size.
pub fn aspect_ratio_for_size(size: &str) -> &'static str {
    const SUPPORTED: [(&str, f64); 7] = [
        ("1:1", 1.0),
        ("16:9", 16.0 / 9.0),
        ("9:16", 9.0 / 16.0),
        ("4:3", 4.0 / 3.0),
        ("3:4", 3.0 / 4.0),
        ("3:2", 3.0 / 2.0),
        ("2:3", 2.0 / 3.0),
    ];
    let (width, height) = dryrun::parse_dims(size);
    let ratio = width as f64 / height as f64;
    SUPPORTED
        .iter()
        .min_by(|left, right| {
            (left.1 - ratio)
                .abs()
                .partial_cmp(&(right.1 - ratio).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(label, _)| *label)
        .unwrap_or("1:1")
}
