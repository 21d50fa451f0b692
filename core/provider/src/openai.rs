use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use async_trait::async_trait;
use atelier_model::{GenerateParams, ProviderConfig, ProviderDescriptor};

use crate::adapter::{guarded, retrying, validate_common, Adapter, CallCtx, GenerateOutput};
use crate::error::ProviderError;
use crate::gemini::{classify_status, upstream_message};
use crate::{dimensions, probe, Result};

/// Adapter for OpenAI-compatible image endpoints
/// (`/v1/images/generations`, `/v1/images/edits`).
pub struct OpenAiAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(config: ProviderConfig) -> Result<OpenAiAdapter> {
        if config.api_base.trim().is_empty() {
            return Err(ProviderError::InvalidParams(format!(
                "provider [{}] has no api base",
                config.name
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(u64::from(config.timeout_secs)))
            .build()
            .map_err(|e| ProviderError::InvalidParams(e.to_string()))?;
        Ok(OpenAiAdapter { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn size_param(params: &GenerateParams) -> String {
        let (width, height) = dimensions::resolve(params.aspect_ratio, params.image_size);
        format!("{}x{}", width, height)
    }

    async fn generations(&self, params: &GenerateParams) -> Result<reqwest::Response> {
        let body = json!({
            "model": params.model_id,
            "prompt": params.prompt,
            "n": params.count,
            "size": Self::size_param(params),
            "response_format": "b64_json",
        });
        Ok(self
            .client
            .post(self.endpoint("images/generations"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?)
    }

    /// Reference images go through the edits endpoint, which only takes
    /// multipart bodies.
    async fn edits(&self, params: &GenerateParams) -> Result<reqwest::Response> {
        let mut form = reqwest::multipart::Form::new()
            .text("model", params.model_id.clone())
            .text("prompt", params.prompt.clone())
            .text("n", params.count.to_string())
            .text("size", Self::size_param(params))
            .text("response_format", "b64_json");
        for (index, reference) in params.ref_images.iter().enumerate() {
            let part = reqwest::multipart::Part::bytes(reference.bytes.clone())
                .file_name(format!("ref_{}.bin", index))
                .mime_str(&reference.mime)
                .map_err(|e| ProviderError::InvalidParams(e.to_string()))?;
            form = form.part("image[]", part);
        }
        Ok(self
            .client
            .post(self.endpoint("images/edits"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?)
    }

    async fn collect_images(&self, response: reqwest::Response) -> Result<GenerateOutput> {
        let status = response.status();
        if !status.is_success() {
            let message = upstream_message(response).await;
            return Err(classify_status(status, message));
        }

        let body = response.json::<ImagesResponse>().await?;
        let mut output = GenerateOutput::default();
        for datum in body.data {
            let b64 = datum.b64_json.ok_or_else(|| {
                ProviderError::Malformed("expected base64 payload in response".into())
            })?;
            let bytes = base64::decode(&b64).map_err(|e| {
                ProviderError::Malformed(format!("invalid base64 image payload: {}", e))
            })?;
            let info = probe::probe(&bytes)?;
            output.images.push(crate::GeneratedImage {
                bytes,
                mime: info.mime.to_string(),
                ext: info.ext.to_string(),
                width: info.width,
                height: info.height,
            });
        }
        if output.images.is_empty() {
            return Err(ProviderError::Refused("empty image response".into()));
        }
        output.meta = json!({ "provider": self.config.name });
        Ok(output)
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: self.config.name.clone(),
            display_name: self.config.display_name.clone(),
            family: "openai".to_string(),
            enabled: self.config.enabled,
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.timeout_secs))
    }

    fn validate(&self, params: &GenerateParams) -> Result<()> {
        validate_common(params)
    }

    async fn generate(&self, ctx: &CallCtx, params: &GenerateParams) -> Result<GenerateOutput> {
        self.validate(params)?;
        retrying(ctx, self.config.max_retries, self.name(), || {
            guarded(ctx, async {
                let response = if params.ref_images.is_empty() {
                    self.generations(params).await?
                } else {
                    self.edits(params).await?
                };
                self.collect_images(response).await
            })
        })
        .await
    }

    async fn optimize_prompt(
        &self,
        ctx: &CallCtx,
        model: &str,
        prompt: &str,
        response_format: Option<&str>,
    ) -> Result<String> {
        let mut body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": crate::api::OPTIMIZE_INSTRUCTION },
                { "role": "user", "content": prompt },
            ],
        });
        if let Some(format) = response_format {
            body["response_format"] = json!({ "type": format });
        }

        retrying(ctx, self.config.max_retries, self.name(), || {
            guarded(ctx, async {
                let response = self
                    .client
                    .post(self.endpoint("chat/completions"))
                    .bearer_auth(&self.config.api_key)
                    .json(&body)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    let message = upstream_message(response).await;
                    return Err(classify_status(status, message));
                }
                let completion = response.json::<ChatResponse>().await?;
                let text = completion
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
                    .unwrap_or_default();
                if text.trim().is_empty() {
                    return Err(ProviderError::Refused("empty rewrite response".into()));
                }
                Ok(text.trim().to_string())
            })
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}
