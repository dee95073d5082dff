use base64::{engine::general_purpose, Engine as _};

use crate::error::AnalysisError;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn normalize_image_mime_type(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/heif" => "image/heic".to_string(),
        _ => lowered,
    }
}

fn is_supported_image(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "image/png" | "image/jpeg" | "image/webp" | "image/heic"
    )
}

/// An image as handed over by the capture layer.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// `data:<mime>;base64,<payload>`, or a bare base64 payload.
    DataUrl(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageInput {
    pub fn into_captured(self) -> Result<CapturedImage, AnalysisError> {
        let (bytes, declared) = match self {
            ImageInput::Bytes(bytes) => (bytes, None),
            ImageInput::DataUrl(url) => decode_data_url(&url)?,
        };
        if bytes.is_empty() {
            return Err(AnalysisError::InvalidImage("image is empty".to_string()));
        }

        let mime_type = declared
            .map(|mime| normalize_image_mime_type(&mime))
            .filter(|mime| is_supported_image(mime))
            .or_else(|| detect_mime_type(&bytes).map(|mime| normalize_image_mime_type(&mime)))
            .filter(|mime| is_supported_image(mime))
            // Camera captures without a recognizable header are almost always JPEG.
            .unwrap_or_else(|| "image/jpeg".to_string());

        Ok(CapturedImage { bytes, mime_type })
    }
}

fn decode_data_url(url: &str) -> Result<(Vec<u8>, Option<String>), AnalysisError> {
    let trimmed = url.trim();
    let (header, payload) = match trimmed.split_once(',') {
        Some((header, payload)) => (Some(header), payload),
        None => (None, trimmed),
    };

    let declared = header
        .and_then(|header| header.strip_prefix("data:"))
        .and_then(|rest| rest.split(';').next())
        .map(str::trim)
        .filter(|mime| !mime.is_empty())
        .map(str::to_string);

    let compact: String = payload.chars().filter(|ch| !ch.is_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| AnalysisError::InvalidImage(err.to_string()))?;
    Ok((bytes, declared))
}
