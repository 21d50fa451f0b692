use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use async_trait::async_trait;
use atelier_model::{GenerateParams, ProviderConfig, ProviderDescriptor};

use crate::adapter::{guarded, retrying, validate_common, Adapter, CallCtx, GenerateOutput};
use crate::error::ProviderError;
use crate::{dimensions, probe, Result};

const API_VERSION: &str = "v1beta";

/// Adapter for Gemini-family endpoints (`models/{model}:generateContent`).
pub struct GeminiAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(config: ProviderConfig) -> Result<GeminiAdapter> {
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
        Ok(GeminiAdapter { config, client })
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/{}/models/{}:generateContent",
            self.config.api_base.trim_end_matches('/'),
            API_VERSION,
            model
        )
    }

    fn request_body(&self, params: &GenerateParams) -> serde_json::Value {
        let mut parts = vec![json!({ "text": params.prompt })];
        for reference in &params.ref_images {
            parts.push(json!({
                "inline_data": {
                    "mime_type": reference.mime,
                    "data": base64::encode(&reference.bytes),
                }
            }));
        }
        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": {
                    "aspectRatio": params.aspect_ratio.to_string(),
                    "imageSize": params.image_size.to_string(),
                },
                "candidateCount": 1,
            },
        })
    }

    async fn call(&self, model: &str, body: &serde_json::Value) -> Result<GenerateContentResponse> {
        let response = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = upstream_message(response).await;
            return Err(classify_status(status, message));
        }
        Ok(response.json::<GenerateContentResponse>().await?)
    }

    fn collect_images(&self, response: GenerateContentResponse) -> Result<GenerateOutput> {
        if let Some(feedback) = response.prompt_feedback {
            if let Some(reason) = feedback.block_reason {
                return Err(ProviderError::Refused(format!(
                    "prompt blocked upstream: {}",
                    reason
                )));
            }
        }

        let mut output = GenerateOutput::default();
        let candidates = response.candidates.unwrap_or_default();
        for candidate in &candidates {
            let parts = candidate
                .content
                .as_ref()
                .and_then(|content| content.parts.as_ref());
            for part in parts.into_iter().flatten() {
                let inline = match &part.inline_data {
                    Some(inline) => inline,
                    None => continue,
                };
                let bytes = base64::decode(&inline.data).map_err(|e| {
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
        }

        if output.images.is_empty() {
            let reason = candidates
                .first()
                .and_then(|c| c.finish_reason.clone())
                .unwrap_or_else(|| "no image parts in response".to_string());
            return Err(ProviderError::Refused(reason));
        }
        output.meta = json!({ "provider": self.config.name, "candidates": candidates.len() });
        Ok(output)
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: self.config.name.clone(),
            display_name: self.config.display_name.clone(),
            family: "gemini".to_string(),
            enabled: self.config.enabled,
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.timeout_secs))
    }

    fn validate(&self, params: &GenerateParams) -> Result<()> {
        validate_common(params)?;
        // Upstream limit on reference parts per request.
        if params.ref_images.len() > 16 {
            return Err(ProviderError::InvalidParams(format!(
                "too many reference images: {}",
                params.ref_images.len()
            )));
        }
        Ok(())
    }

    async fn generate(&self, ctx: &CallCtx, params: &GenerateParams) -> Result<GenerateOutput> {
        self.validate(params)?;
        let (width, height) =
            dimensions::resolve(params.aspect_ratio, params.image_size);
        log::debug!(
            "[{}] generating {}x{} image(s) with model [{}]",
            self.config.name,
            width,
            height,
            params.model_id
        );

        let body = self.request_body(params);
        retrying(ctx, self.config.max_retries, self.name(), || {
            guarded(ctx, async {
                let response = self.call(&params.model_id, &body).await?;
                self.collect_images(response)
            })
        })
        .await
    }

    async fn optimize_prompt(
        &self,
        ctx: &CallCtx,
        model: &str,
        prompt: &str,
        _response_format: Option<&str>,
    ) -> Result<String> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": format!("{}\n\n{}", crate::api::OPTIMIZE_INSTRUCTION, prompt) }],
            }],
        });
        retrying(ctx, self.config.max_retries, self.name(), || {
            guarded(ctx, async {
                let response = self.call(model, &body).await?;
                let text = response
                    .candidates
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|c| c.content)
                    .filter_map(|c| c.parts)
                    .flatten()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("");
                if text.trim().is_empty() {
                    return Err(ProviderError::Refused("empty rewrite response".into()));
                }
                Ok(text.trim().to_string())
            })
        })
        .await
    }
}

pub(crate) fn classify_status(status: reqwest::StatusCode, message: String) -> ProviderError {
    if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient(format!("upstream {}: {}", status, message))
    } else {
        ProviderError::Refused(format!("upstream {}: {}", status, message))
    }
}

pub(crate) async fn upstream_message(response: reqwest::Response) -> String {
    match response.json::<UpstreamError>().await {
        Ok(body) => body.error.map(|e| e.message).unwrap_or_default(),
        Err(_) => String::new(),
    }
}

#[derive(Deserialize)]
pub(crate) struct UpstreamError {
    pub error: Option<UpstreamErrorBody>,
}

#[derive(Deserialize)]
pub(crate) struct UpstreamErrorBody {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    parts: Option<Vec<Part>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    data: String,
}
