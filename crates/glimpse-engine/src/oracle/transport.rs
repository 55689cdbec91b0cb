use std::fmt;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};

use crate::config::OracleConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl EncodedImage {
    pub fn png(image: &DynamicImage) -> Result<Self> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("failed encoding oracle image as PNG")?;
        Ok(Self {
            mime: "image/png",
            bytes,
        })
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub prompt: String,
    pub images: Vec<EncodedImage>,
    pub max_output_tokens: u32,
}

/// Moves one prompt plus images to the recognition service and returns its
/// free-text answer.
pub trait OracleTransport: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &OracleRequest) -> Result<String>;
}

/// Non-success HTTP status from the oracle service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleHttpError {
    pub status: u16,
    pub body: String,
}

impl OracleHttpError {
    pub fn is_transient(&self) -> bool {
        self.status == 408 || self.status == 429 || (500..=599).contains(&self.status)
    }
}

impl fmt::Display for OracleHttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "oracle request failed ({}): {}",
            self.status,
            truncate_text(&self.body, 512)
        )
    }
}

impl std::error::Error for OracleHttpError {}

/// Transport failures and throttling/server statuses are worth another try;
/// everything else (bad key, malformed payload) is not.
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(http) = cause.downcast_ref::<OracleHttpError>() {
            return http.is_transient();
        }
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

/// Chat-completions vision endpoint with images sent inline as data URLs.
pub struct OpenAiVisionTransport {
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
    http: HttpClient,
}

impl OpenAiVisionTransport {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let Some(api_key) = config.api_key.clone() else {
            bail!("OPENAI_API_KEY not set");
        };
        Ok(Self {
            endpoint: format!("{}/chat/completions", config.api_base),
            api_key,
            model: config.model.clone(),
            timeout: config.request_timeout,
            http: HttpClient::new(),
        })
    }

    fn build_payload(&self, request: &OracleRequest) -> Value {
        let mut content = vec![json!({"type": "text", "text": request.prompt})];
        for image in &request.images {
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": image.data_url()},
            }));
        }
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": content,
            }],
            "max_tokens": request.max_output_tokens,
        })
    }
}

impl OracleTransport for OpenAiVisionTransport {
    fn name(&self) -> &str {
        "openai"
    }

    fn complete(&self, request: &OracleRequest) -> Result<String> {
        let payload = self.build_payload(request);
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("oracle request failed ({})", self.endpoint))?;

        let status = response.status();
        let body = response
            .text()
            .context("oracle response body read failed")?;
        if !status.is_success() {
            return Err(OracleHttpError {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        let parsed: Value = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("oracle returned invalid JSON ({err}); treating answer as empty");
                return Ok(String::new());
            }
        };
        Ok(extract_chat_text(&parsed))
    }
}

/// Text of the first choice; content may be a string or a list of parts.
pub(crate) fn extract_chat_text(response: &Value) -> String {
    let Some(content) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
    else {
        return String::new();
    };
    if let Some(text) = content.as_str() {
        return text.trim().to_string();
    }
    content
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .collect::<Vec<&str>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, RgbImage};
    use serde_json::json;

    use super::*;

    #[test]
    fn extract_chat_text_reads_string_content() {
        let response = json!({
            "choices": [{"message": {"role": "assistant", "content": "  YES \n"}}]
        });
        assert_eq!(extract_chat_text(&response), "YES");
    }

    #[test]
    fn extract_chat_text_joins_content_parts() {
        let response = json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "75"},
                {"type": "text", "text": " "},
                {"type": "text", "text": "percent"}
            ]}}]
        });
        assert_eq!(extract_chat_text(&response), "75\npercent");
    }

    #[test]
    fn extract_chat_text_tolerates_missing_fields() {
        assert_eq!(extract_chat_text(&json!({})), "");
        assert_eq!(extract_chat_text(&json!({"choices": []})), "");
    }

    #[test]
    fn http_status_retryability() {
        let transient = anyhow::Error::new(OracleHttpError {
            status: 503,
            body: "busy".to_string(),
        });
        assert!(is_retryable_error(&transient));

        let limited = anyhow::Error::new(OracleHttpError {
            status: 429,
            body: String::new(),
        })
        .context("oracle call");
        assert!(is_retryable_error(&limited));

        let denied = anyhow::Error::new(OracleHttpError {
            status: 401,
            body: "bad key".to_string(),
        });
        assert!(!is_retryable_error(&denied));
        assert!(!is_retryable_error(&anyhow::anyhow!("plain failure")));
    }

    #[test]
    fn payload_inlines_images_as_data_urls() -> anyhow::Result<()> {
        let config = OracleConfig {
            api_key: Some("test-key".to_string()),
            ..OracleConfig::default()
        };
        let transport = OpenAiVisionTransport::new(&config)?;
        let image = EncodedImage::png(&DynamicImage::ImageRgb8(RgbImage::new(4, 4)))?;
        let payload = transport.build_payload(&OracleRequest {
            prompt: "Answer only YES or NO.".to_string(),
            images: vec![image],
            max_output_tokens: 10,
        });

        assert_eq!(payload["model"], json!("gpt-4o"));
        assert_eq!(payload["max_tokens"], json!(10));
        let content = payload["messages"][0]["content"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["text"], json!("Answer only YES or NO."));
        assert!(content[1]["image_url"]["url"]
            .as_str()
            .unwrap_or("")
            .starts_with("data:image/png;base64,"));
        Ok(())
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let config = OracleConfig {
            api_key: None,
            ..OracleConfig::default()
        };
        assert!(OpenAiVisionTransport::new(&config).is_err());
    }
}
