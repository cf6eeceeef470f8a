//! Thin client for the Gemini image endpoints: prompt-to-image generation,
//! prompt-driven editing of uploaded images, and image-to-prompt analysis.

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GENERATE_MODEL: &str = "imagen-4.0-generate-001";
const EDIT_MODEL: &str = "gemini-2.5-flash-image-preview";
const ANALYZE_MODEL: &str = "gemini-2.5-flash";

const ANALYZE_INSTRUCTION: &str = "Describe this image in detail for an image generation prompt. \
    Be specific about subjects, style, composition, colors, and lighting. Output only the prompt \
    text, without any introductory phrases or other conversational text.";

/// Aspect ratios accepted by the generation endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum AspectRatio {
    #[default]
    Square,
    Wide,
    Tall,
    Landscape,
    Portrait,
}

impl AspectRatio {
    pub const ALL: [Self; 5] = [
        Self::Square,
        Self::Wide,
        Self::Tall,
        Self::Landscape,
        Self::Portrait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Wide => "16:9",
            Self::Tall => "9:16",
            Self::Landscape => "4:3",
            Self::Portrait => "3:4",
        }
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image travelling to or from the API: raw bytes plus their mime type.
#[derive(Clone)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

// Wire format for the Imagen predict endpoint.

#[derive(Serialize)]
struct PredictRequest<'a> {
    instances: Vec<PredictInstance<'a>>,
    parameters: PredictParameters<'a>,
}

#[derive(Serialize)]
struct PredictInstance<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters<'a> {
    sample_count: usize,
    aspect_ratio: &'a str,
    output_mime_type: &'a str,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: String,
    #[serde(default)]
    mime_type: Option<String>,
}

// Wire format for the generateContent endpoint.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl Part {
    fn from_payload(payload: &ImagePayload) -> Self {
        Self {
            inline_data: Some(InlineData {
                mime_type: payload.mime.clone(),
                data: BASE64.encode(&payload.bytes),
            }),
            ..Default::default()
        }
    }

    fn from_text(text: &str) -> Self {
        Self {
            text: Some(text.to_owned()),
            ..Default::default()
        }
    }
}

impl GenerateContentResponse {
    fn into_parts(self) -> Vec<Part> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    agent: ureq::Agent,
    api_key: String,
}

impl GeminiClient {
    /// Reads the API key from `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY environment variable not set")?;
        Ok(Self {
            agent: ureq::agent(),
            api_key,
        })
    }

    fn post<T: for<'de> Deserialize<'de>>(
        &self,
        model: &str,
        action: &str,
        body: impl Serialize,
    ) -> Result<T> {
        let url = format!("{API_BASE}/{model}:{action}");
        log::info!("POST {url}");
        let response = self
            .agent
            .post(&url)
            .set("x-goog-api-key", &self.api_key)
            .send_json(body)
            .with_context(|| format!("request to {model} failed"))?;
        response
            .into_json()
            .with_context(|| format!("malformed response from {model}"))
    }

    /// Generate `count` images from a text prompt.
    pub fn generate(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        count: usize,
    ) -> Result<Vec<ImagePayload>> {
        let request = PredictRequest {
            instances: vec![PredictInstance { prompt }],
            parameters: PredictParameters {
                sample_count: count,
                aspect_ratio: aspect_ratio.as_str(),
                output_mime_type: "image/png",
            },
        };
        let response: PredictResponse = self.post(GENERATE_MODEL, "predict", request)?;
        if response.predictions.is_empty() {
            bail!("the API returned no generated images");
        }

        response
            .predictions
            .into_iter()
            .map(|p| {
                Ok(ImagePayload {
                    bytes: BASE64
                        .decode(&p.bytes_base64_encoded)
                        .context("generated image was not valid base64")?,
                    mime: p.mime_type.unwrap_or_else(|| "image/png".to_owned()),
                })
            })
            .collect()
    }

    /// Edit one or more images according to a text prompt, returning the
    /// single image the model produced.
    pub fn edit(&self, images: &[ImagePayload], prompt: &str) -> Result<ImagePayload> {
        let mut parts: Vec<Part> = images.iter().map(Part::from_payload).collect();
        parts.push(Part::from_text(prompt));

        let request = GenerateContentRequest {
            contents: vec![Content { parts }],
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["IMAGE", "TEXT"],
            }),
        };
        let response: GenerateContentResponse =
            self.post(EDIT_MODEL, "generateContent", request)?;

        let parts = response.into_parts();
        if let Some(data) = parts.iter().find_map(|p| p.inline_data.as_ref()) {
            return Ok(ImagePayload {
                bytes: BASE64
                    .decode(&data.data)
                    .context("edited image was not valid base64")?,
                mime: data.mime_type.clone(),
            });
        }
        // The model sometimes answers with prose instead of pixels; surface
        // that text so the user sees why there is no image.
        if let Some(text) = parts.into_iter().find_map(|p| p.text) {
            bail!("the API returned text instead of an image: \"{text}\"");
        }
        Err(anyhow!("no edited image in the API response"))
    }

    /// Produce a descriptive generation prompt for an image.
    pub fn analyze(&self, image: &ImagePayload) -> Result<String> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part::from_payload(image), Part::from_text(ANALYZE_INSTRUCTION)],
            }],
            generation_config: None,
        };
        let response: GenerateContentResponse =
            self.post(ANALYZE_MODEL, "generateContent", request)?;

        response
            .into_parts()
            .into_iter()
            .find_map(|p| p.text)
            .map(|t| t.trim().to_owned())
            .ok_or_else(|| anyhow!("the API did not return a text description"))
    }
}
