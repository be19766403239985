use std::time::Duration;

use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

use crate::error::{classify_failure, truncate_text, ProviderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallBody {
    Empty,
    Json(Value),
    Multipart(Vec<FormField>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub name: String,
    pub value: FormValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    File {
        bytes: Vec<u8>,
        filename: String,
        mime_type: String,
    },
}

impl FormField {
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: FormValue::Text(value.into()),
        }
    }

    pub fn file(name: &str, bytes: Vec<u8>, filename: &str, mime_type: &str) -> Self {
        Self {
            name: name.to_string(),
            value: FormValue::File {
                bytes,
                filename: filename.to_string(),
                mime_type: mime_type.to_string(),
            },
        }
    }
}

/// One outbound request, fully described before it is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpCall {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: CallBody,
    pub timeout: Duration,
}

impl HttpCall {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            bearer: None,
            body: CallBody::Empty,
            timeout,
        }
    }

    pub fn post_json(url: impl Into<String>, payload: Value, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            bearer: None,
            body: CallBody::Json(payload),
            timeout,
        }
    }

    pub fn post_multipart(url: impl Into<String>, fields: Vec<FormField>, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            bearer: None,
            body: CallBody::Multipart(fields),
            timeout,
        }
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            CallBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends fully-built calls. Blocking; one call at a time.
pub trait Transport: Send + Sync {
    fn send(&self, provider: &str, call: HttpCall) -> Result<HttpReply, ProviderError>;
}

pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn send(&self, provider: &str, call: HttpCall) -> Result<HttpReply, ProviderError> {
        let mut builder = match call.method {
            Method::Get => self.http.get(&call.url),
            Method::Post => self.http.post(&call.url),
        }
        .timeout(call.timeout);
        if let Some(token) = &call.bearer {
            builder = builder.bearer_auth(token);
        }
        builder = match call.body {
            CallBody::Empty => builder,
            CallBody::Json(payload) => builder.json(&payload),
            CallBody::Multipart(fields) => {
                builder.multipart(multipart_form(fields).map_err(|err| {
                    ProviderError::malformed(provider, format!("invalid multipart field: {err}"))
                })?)
            }
        };

        let response = builder
            .send()
            .map_err(|err| transport_error(provider, &call.url, &err))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| transport_error(provider, &call.url, &err))?;
        Ok(HttpReply { status, body })
    }
}

fn multipart_form(fields: Vec<FormField>) -> Result<MultipartForm, reqwest::Error> {
    let mut form = MultipartForm::new();
    for field in fields {
        form = match field.value {
            FormValue::Text(text) => form.text(field.name, text),
            FormValue::File {
                bytes,
                filename,
                mime_type,
            } => {
                let part = MultipartPart::bytes(bytes)
                    .file_name(filename)
                    .mime_str(&mime_type)?;
                form.part(field.name, part)
            }
        };
    }
    Ok(form)
}

fn transport_error(provider: &str, url: &str, err: &reqwest::Error) -> ProviderError {
    ProviderError::Transport {
        provider: provider.to_string(),
        message: truncate_text(&format!("{err} ({url})"), 480),
        timed_out: err.is_timeout(),
    }
}

/// Parses a 2xx JSON reply or classifies the failure.
pub fn json_or_error(provider: &str, reply: HttpReply) -> Result<Value, ProviderError> {
    if !reply.is_success() {
        return Err(classify_failure(provider, reply.status, &reply.body));
    }
    serde_json::from_str(&reply.body).map_err(|err| {
        ProviderError::malformed(
            provider,
            format!("invalid JSON payload ({err}): {}", truncate_text(&reply.body, 200)),
        )
    })
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::{HttpCall, HttpReply, Transport};
    use crate::error::ProviderError;

    /// Replays canned replies in order and records every call it receives.
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<HttpReply, ProviderError>>>,
        calls: Mutex<Vec<HttpCall>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, status: u16, body: impl Into<String>) -> Self {
            self.push(Ok(HttpReply::new(status, body)));
            self
        }

        pub fn reply_json(self, body: serde_json::Value) -> Self {
            self.reply(200, body.to_string())
        }

        pub fn fail(self, err: ProviderError) -> Self {
            self.push(Err(err));
            self
        }

        fn push(&self, reply: Result<HttpReply, ProviderError>) {
            if let Ok(mut replies) = self.replies.lock() {
                replies.push_back(reply);
            }
        }

        pub fn calls(&self) -> Vec<HttpCall> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        pub fn remaining(&self) -> usize {
            self.replies.lock().map(|replies| replies.len()).unwrap_or(0)
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&self, provider: &str, call: HttpCall) -> Result<HttpReply, ProviderError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
            self.replies
                .lock()
                .ok()
                .and_then(|mut replies| replies.pop_front())
                .unwrap_or_else(|| {
                    Err(ProviderError::Transport {
                        provider: provider.to_string(),
                        message: "no scripted reply left".to_string(),
                        timed_out: false,
                    })
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_or_error_parses_success_and_classifies_failures() {
        let value = json_or_error("deepseek", HttpReply::new(200, r#"{"ok":true}"#)).unwrap();
        assert_eq!(value["ok"], json!(true));

        let err = json_or_error("deepseek", HttpReply::new(429, "{}")).unwrap_err();
        assert!(err.is_rate_limited());

        let err = json_or_error("deepseek", HttpReply::new(200, "<html>")).unwrap_err();
        assert_eq!(err.kind(), "malformed");
    }

    #[test]
    fn builders_keep_timeout_and_bearer() {
        let call = HttpCall::post_json(
            "https://api.example.com/v1/chat/completions",
            json!({"model": "m"}),
            Duration::from_secs(60),
        )
        .bearer("sk-1");
        assert_eq!(call.method, Method::Post);
        assert_eq!(call.bearer.as_deref(), Some("sk-1"));
        assert_eq!(call.timeout, Duration::from_secs(60));
        assert_eq!(call.json_body().and_then(|body| body["model"].as_str()), Some("m"));
    }

    #[test]
    fn multipart_form_accepts_text_and_file_fields() {
        let form = multipart_form(vec![
            FormField::text("prompt", "a bowl of rice"),
            FormField::file("image", vec![0xff, 0xd8], "dish.jpg", "image/jpeg"),
        ]);
        assert!(form.is_ok());

        let bad = multipart_form(vec![FormField::file("image", vec![1], "x", "not a mime")]);
        assert!(bad.is_err());
    }
}
