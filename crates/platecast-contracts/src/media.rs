use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// One uploaded photo. Owned by the pipeline invocation that received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    bytes: Vec<u8>,
    mime_type: String,
    filename: String,
}

impl MediaAsset {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
            filename: filename.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn data_uri(&self) -> String {
        data_uri(&self.mime_type, &self.bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantInput {
    pub dish_name: String,
    pub selling_points: String,
    pub context: String,
}

impl MerchantInput {
    pub fn new(dish_name: impl Into<String>, selling_points: impl Into<String>) -> Self {
        Self {
            dish_name: dish_name.into(),
            selling_points: selling_points.into(),
            context: String::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn dish_name(&self) -> Option<&str> {
        non_empty(&self.dish_name)
    }

    pub fn selling_points(&self) -> Option<&str> {
        non_empty(&self.selling_points)
    }

    pub fn context(&self) -> Option<&str> {
        non_empty(&self.context)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisionDescription(String);

impl VisionDescription {
    /// Returns `None` when the provider produced only whitespace.
    pub fn new(text: impl AsRef<str>) -> Option<Self> {
        non_empty(text.as_ref()).map(|value| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratedCopy(String);

impl GeneratedCopy {
    pub fn new(text: impl AsRef<str>) -> Option<Self> {
        non_empty(text.as_ref()).map(|value| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedImageRef {
    Url(String),
    Inline { mime_type: String, bytes: Vec<u8> },
}

impl RenderedImageRef {
    /// Displayable locator: the remote URL, or a `data:` URI for inline bytes.
    pub fn locator(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Inline { mime_type, bytes } => data_uri(mime_type, bytes),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Url(_))
    }
}

pub fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(bytes))
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vision_description_rejects_blank_text() {
        assert!(VisionDescription::new("  \n ").is_none());
        assert_eq!(
            VisionDescription::new(" 红烧肉饭 ").map(|value| value.as_str().to_string()),
            Some("红烧肉饭".to_string())
        );
    }

    #[test]
    fn inline_locator_is_a_data_uri() {
        let image = RenderedImageRef::Inline {
            mime_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        };
        assert_eq!(image.locator(), "data:image/png;base64,AQID");
        assert!(!image.is_remote());
    }

    #[test]
    fn merchant_input_treats_blank_fields_as_missing() {
        let input = MerchantInput::new("  ", "分量大").with_context("\t");
        assert_eq!(input.dish_name(), None);
        assert_eq!(input.selling_points(), Some("分量大"));
        assert_eq!(input.context(), None);
    }
}
