use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use forward_contracts::entries::{EntrySequence, GeneratedEntry, ORIGINAL_LABEL};
use forward_contracts::errors::{GenerationError, UploadError};
use forward_contracts::events::EventLog;
use forward_contracts::summary::{write_summary, RunSummary};
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub mod collage;

pub const GEMINI_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

const SUPPORTED_MIME_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];
const DRYRUN_PORTRAIT_SIZE: u32 = 512;

/// The uploaded photo, encoded once per run and reused for every year.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub base64: String,
    pub mime_type: String,
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// Gate an upload before a run touches it: the file must exist and its
/// declared type must be on the allow-list.
pub fn validate_upload(path: &Path) -> Result<&'static str, UploadError> {
    if !path.is_file() {
        return Err(UploadError::MissingImage(path.display().to_string()));
    }
    let declared = mime_for_path(path).ok_or_else(|| {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("unknown");
        UploadError::UnsupportedFormat(ext.to_string())
    })?;
    if !SUPPORTED_MIME_TYPES.contains(&declared) {
        return Err(UploadError::UnsupportedFormat(declared.to_string()));
    }
    Ok(declared)
}

/// Read the upload and produce its base64 content, no `data:` prefix.
pub fn encode_image_file(path: &Path) -> Result<EncodedImage, UploadError> {
    let mime_type = validate_upload(path)?;
    let bytes =
        fs::read(path).map_err(|err| UploadError::UnreadableFile(err.to_string()))?;
    if bytes.is_empty() {
        return Err(UploadError::EmptyPayload);
    }
    Ok(EncodedImage {
        base64: BASE64.encode(&bytes),
        mime_type: mime_type.to_string(),
    })
}

/// Split a `data:` URI into its decoded bytes and MIME type.
pub fn decode_data_uri(value: &str) -> Result<(Vec<u8>, String)> {
    let (meta, payload) = value
        .split_once(',')
        .ok_or_else(|| anyhow::anyhow!("invalid data URI image payload"))?;
    let mime = meta
        .trim()
        .strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .unwrap_or("image/png")
        .to_string();
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .context("data URI base64 decode failed")?;
    Ok((bytes, mime))
}

/// Prompt sent with every per-year call. Aging severity is tied to the year
/// so consecutive years read as one progressive timeline.
pub fn aging_prompt(year: &str) -> String {
    format!(
        "Your task is to generate a new photorealistic portrait that shows what the person in \
         the original photo might look like in the year {year}. It is crucial that the aging \
         process is realistic and progressive. For the year {year}, introduce appropriate signs \
         of aging such as fine lines, deeper wrinkles around the eyes and mouth, subtle changes \
         in skin elasticity, and some graying of the hair. The signs of aging should be more \
         pronounced than they would be for an earlier year and less pronounced than for a later \
         year. Keep the person's core facial structure and identity intact. The background \
         should be neutral (like a plain studio backdrop) and their clothing should be simple \
         and professional (like a suit), to keep the focus on the person's face. The final \
         output must be a high-quality, realistic photograph."
    )
}

pub trait PortraitProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One attempt, no retry: either a displayable `data:image/...` URI or a
    /// typed failure for this year alone.
    fn generate(&self, source: &EncodedImage, year: &str) -> Result<String, GenerationError>;
}

pub fn provider_names() -> [&'static str; 2] {
    ["gemini", "dryrun"]
}

pub fn provider_named(name: &str) -> Option<Box<dyn PortraitProvider>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "gemini" => Some(Box::new(GeminiPortraitProvider::new())),
        "dryrun" => Some(Box::new(DryrunProvider)),
        _ => None,
    }
}

pub struct GeminiPortraitProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiPortraitProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| {
                    "https://generativelanguage.googleapis.com/v1beta".to_string()
                }),
            model: GEMINI_IMAGE_MODEL.to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn with_model(model: impl Into<String>) -> Self {
        let mut provider = Self::new();
        provider.model = model.into();
        provider
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    fn build_payload(&self, source: &EncodedImage, year: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": source.mime_type,
                            "data": source.base64,
                        },
                    },
                    { "text": aging_prompt(year) },
                ],
            }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
            },
        })
    }

    fn first_inline_image(payload: &Value) -> Option<(Option<String>, String)> {
        let candidates = payload.get("candidates").and_then(Value::as_array)?;
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array);
            let Some(parts) = parts else {
                continue;
            };
            for part in parts {
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object);
                let Some(inline) = inline else {
                    continue;
                };
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let mime = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Some((mime, data.to_string()));
            }
        }
        None
    }
}

impl Default for GeminiPortraitProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PortraitProvider for GeminiPortraitProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, source: &EncodedImage, year: &str) -> Result<String, GenerationError> {
        let Some(api_key) = Self::api_key() else {
            return Err(GenerationError::MissingApiKey);
        };
        let endpoint = self.endpoint();
        let payload = self.build_payload(source, year);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .json(&payload)
            .send()
            .map_err(|err| GenerationError::Transport(err.to_string()))?;
        let parsed = response_json(response)?;
        let (mime, data) =
            Self::first_inline_image(&parsed).ok_or(GenerationError::NoImagePayload)?;
        BASE64
            .decode(data.as_bytes())
            .map_err(|err| GenerationError::Protocol(format!("image base64: {err}")))?;
        let mime = mime.unwrap_or_else(|| "image/png".to_string());
        Ok(format!("data:{mime};base64,{data}"))
    }
}

fn response_json(response: HttpResponse) -> Result<Value, GenerationError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| GenerationError::Transport(err.to_string()))?;
    if !status.is_success() {
        return Err(GenerationError::Protocol(format!(
            "status {code}: {}",
            truncate_text(&body, 512)
        )));
    }
    serde_json::from_str(&body)
        .map_err(|_| GenerationError::Protocol("invalid JSON payload".to_string()))
}

/// Offline provider: a flat-color placeholder whose color is derived from
/// the prompt, so the whole pipeline can run without a credential.
pub struct DryrunProvider;

impl PortraitProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, _source: &EncodedImage, year: &str) -> Result<String, GenerationError> {
        let (r, g, b) = color_from_prompt(&aging_prompt(year));
        let mut placeholder = RgbImage::new(DRYRUN_PORTRAIT_SIZE, DRYRUN_PORTRAIT_SIZE);
        for pixel in placeholder.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut buffer = Cursor::new(Vec::new());
        placeholder
            .write_to(&mut buffer, image::ImageFormat::Png)
            .map_err(|err| GenerationError::Protocol(err.to_string()))?;
        Ok(format!(
            "data:image/png;base64,{}",
            BASE64.encode(buffer.into_inner())
        ))
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

/// One generation run: seeds the entry sequence, encodes the upload once,
/// then settles every year strictly in order, one in-flight call at a time.
/// Only this struct mutates the sequence; observers and the collage composer
/// read it.
pub struct GenerationRun {
    run_dir: PathBuf,
    run_id: String,
    events: EventLog,
    provider: Box<dyn PortraitProvider>,
    sequence: EntrySequence,
    source_image: Option<String>,
    started_at: String,
    summary_path: PathBuf,
}

impl GenerationRun {
    pub fn new(
        run_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        provider: Box<dyn PortraitProvider>,
    ) -> Result<Self> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir)?;
        let run_id = run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("run")
            .to_string();
        let events = EventLog::new(events_path.into(), run_id.clone());
        let summary_path = run_dir.join("summary.json");
        let started_at = now_utc_iso();

        events.emit(
            "run_started",
            map_object(json!({
                "out_dir": run_dir.to_string_lossy().to_string(),
                "provider": provider.name(),
            })),
        )?;

        Ok(Self {
            run_dir,
            run_id,
            events,
            provider,
            sequence: EntrySequence::default(),
            source_image: None,
            started_at,
            summary_path,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn sequence(&self) -> &EntrySequence {
        &self.sequence
    }

    pub fn event_log(&self) -> EventLog {
        self.events.clone()
    }

    /// Drive one full run. `on_change` fires after every atomic entry
    /// update; it always sees the entry fully written. A single year's
    /// failure flips that entry to `error` and the run moves on; only
    /// precondition and encode failures abort the whole run, rolling the
    /// sequence back to the Original entry.
    pub fn generate(
        &mut self,
        source_path: &Path,
        years: &[String],
        mut on_change: impl FnMut(&GeneratedEntry),
    ) -> Result<()> {
        validate_upload(source_path)?;

        let display_url = source_path.display().to_string();
        self.source_image = Some(display_url.clone());
        self.sequence = EntrySequence::seed(&display_url, years);
        self.events.emit(
            "sequence_seeded",
            map_object(json!({
                "source": display_url,
                "labels": self.sequence.labels().collect::<Vec<_>>(),
            })),
        )?;
        for entry in self.sequence.iter() {
            on_change(entry);
        }

        let source = match encode_image_file(source_path) {
            Ok(source) => source,
            Err(err) => {
                self.sequence.collapse_to_original();
                self.events.emit(
                    "run_failed",
                    map_object(json!({ "error": err.to_string() })),
                )?;
                for entry in self.sequence.iter() {
                    on_change(entry);
                }
                self.finish()?;
                return Err(err.into());
            }
        };

        let year_labels: Vec<String> = self
            .sequence
            .labels()
            .filter(|label| *label != ORIGINAL_LABEL)
            .map(str::to_string)
            .collect();

        for label in year_labels {
            match self.provider.generate(&source, &label) {
                Ok(image_url) => {
                    let artifact_path = match write_artifact(&self.run_dir, &label, &image_url)
                    {
                        Ok(path) => Some(path.display().to_string()),
                        Err(err) => {
                            self.events.emit(
                                "artifact_write_failed",
                                map_object(json!({
                                    "label": label,
                                    "error": format!("{err:#}"),
                                })),
                            )?;
                            None
                        }
                    };
                    self.sequence.mark_ready(&label, image_url, artifact_path);
                }
                Err(err) => {
                    let message = err.to_string();
                    self.events.emit(
                        "generation_failed",
                        map_object(json!({
                            "label": label,
                            "provider": self.provider.name(),
                            "error": message,
                        })),
                    )?;
                    self.sequence.mark_error(&label, message);
                }
            }
            if let Some(entry) = self.sequence.get(&label) {
                self.events.emit_entry_status(entry)?;
                on_change(entry);
            }
        }

        self.events.emit(
            "run_settled",
            map_object(json!({
                "entries": self.sequence.len(),
                "ready": self.sequence.ready_count(),
            })),
        )?;
        self.finish()?;
        Ok(())
    }

    /// Write `summary.json` for whatever state the sequence is in.
    pub fn finish(&self) -> Result<()> {
        let summary = RunSummary::from_sequence(
            self.run_id.clone(),
            self.started_at.clone(),
            self.source_image.clone().unwrap_or_default(),
            &self.sequence,
        );
        write_summary(&self.summary_path, &summary)?;
        Ok(())
    }
}

fn write_artifact(run_dir: &Path, label: &str, image_url: &str) -> Result<PathBuf> {
    let (bytes, mime) = decode_data_uri(image_url)?;
    let path = run_dir.join(format!(
        "portrait-{}.{}",
        sanitize_label(label),
        extension_for_mime(&mime)
    ));
    fs::write(&path, bytes).with_context(|| format!("failed to save {}", path.display()))?;
    Ok(path)
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}
