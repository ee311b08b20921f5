use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tracing::debug;

use crate::error::{Result, VisionError};
use crate::raster::Image;

/// Instruction sent as the system message when the deployment does not configure one.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant that responds in Vietnamese. Help me solve my math homework step-by-step. Note that put the formulas in a pair of $.";

pub const PNG_MEDIA_TYPE: &str = "image/png";

/// Serialize `image` as PNG.
pub fn encode_png(image: &Image) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .pixels()
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| VisionError::Encode(err.to_string()))?;
    Ok(bytes)
}

/// A base64 image payload tagged with its media type, rendered as a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBlob {
    media_type: String,
    payload: String,
}

impl TransportBlob {
    /// Parse a `data:<mime>;base64,<payload>` URI. The payload is not decoded here.
    pub fn parse(data_uri: &str) -> Result<Self> {
        let rest = data_uri
            .strip_prefix("data:")
            .ok_or_else(|| VisionError::Decode("not a data URI".to_string()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| VisionError::Decode("data URI has no payload".to_string()))?;
        let media_type = header.strip_suffix(";base64").ok_or_else(|| {
            VisionError::Decode(format!("data URI is not base64 encoded: {header}"))
        })?;
        Ok(Self {
            media_type: media_type.to_string(),
            payload: payload.to_string(),
        })
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn data_uri(&self) -> String {
        self.to_string()
    }

    /// Decode the payload back into an RGBA image.
    pub fn decode_image(&self) -> Result<Image> {
        let bytes = BASE64
            .decode(self.payload.as_bytes())
            .map_err(|err| VisionError::Decode(format!("invalid base64 payload: {err}")))?;
        let decoded =
            image::load_from_memory(&bytes).map_err(|err| VisionError::Decode(err.to_string()))?;
        Ok(Image::from_rgba(decoded.to_rgba8()))
    }
}

impl fmt::Display for TransportBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.media_type, self.payload)
    }
}

/// Lossless PNG, base64 encoded, wrapped as a data URI.
pub fn encode(image: &Image) -> Result<TransportBlob> {
    let png = encode_png(image)?;
    let payload = BASE64.encode(&png);
    debug!(
        width = image.width(),
        height = image.height(),
        png_bytes = png.len(),
        payload_len = payload.len(),
        "encoded image for transport"
    );
    Ok(TransportBlob {
        media_type: PNG_MEDIA_TYPE.to_string(),
        payload,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System { content: String },
    User { content: Vec<ContentPart> },
}

/// One question about one image, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionQuery {
    system_instruction: String,
    question: String,
    image: TransportBlob,
}

impl VisionQuery {
    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn image(&self) -> &TransportBlob {
        &self.image
    }

    /// The system message followed by the user message; the user content is the question text
    /// then the image.
    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage::System {
                content: self.system_instruction.clone(),
            },
            ChatMessage::User {
                content: vec![
                    ContentPart::Text {
                        text: self.question.clone(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: self.image.data_uri(),
                        },
                    },
                ],
            },
        ]
    }
}

/// Builds queries that share one system instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuilder {
    system_instruction: String,
}

impl QueryBuilder {
    pub fn new(system_instruction: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
        }
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn build(&self, image: &Image, question: &str) -> Result<VisionQuery> {
        Ok(VisionQuery {
            system_instruction: self.system_instruction.clone(),
            question: question.to_string(),
            image: encode(image)?,
        })
    }
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_INSTRUCTION)
    }
}
