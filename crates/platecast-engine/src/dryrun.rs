//! Offline provider used by `--dryrun` runs and tests. Every answer is a pure
//! function of the request, so runs are reproducible without credentials.

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, Rgb, RgbImage};
use platecast_contracts::media::{MediaAsset, RenderedImageRef};
use sha2::{Digest, Sha256};

use crate::client::ChatMessage;
use crate::error::ProviderError;

const PREVIEW_MAX_DIM: u32 = 64;

pub(crate) fn describe(asset: &MediaAsset) -> String {
    let stem = Path::new(asset.filename())
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("dish")
        .replace(['_', '-'], " ");
    let base = if stem.trim().is_empty() {
        "dish".to_string()
    } else {
        stem.trim().to_string()
    };
    format!("{base}, plated and photographed from above ({})", short_id(asset.bytes()))
}

pub(crate) fn complete(messages: &[ChatMessage]) -> String {
    let prompt = messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.as_str())
        .unwrap_or_default();
    let headline: String = prompt
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("dryrun")
        .chars()
        .take(60)
        .collect();
    format!("[dryrun {}] {headline}", short_id(prompt.as_bytes()))
}

pub(crate) fn render(prompt: &str, size: &str) -> Result<RenderedImageRef, ProviderError> {
    let (width, height) = parse_dims(size);
    let scale = (width.max(height) as f64 / PREVIEW_MAX_DIM as f64).max(1.0);
    let width = ((width as f64 / scale).round() as u32).max(1);
    let height = ((height as f64 / scale).round() as u32).max(1);

    let (r, g, b) = color_from_prompt(prompt);
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| ProviderError::malformed("dryrun", format!("png encode failed: {err}")))?;
    Ok(RenderedImageRef::Inline {
        mime_type: "image/png".to_string(),
        bytes,
    })
}

pub(crate) fn parse_dims(size: &str) -> (u32, u32) {
    let mut parts = size.trim().split(['x', 'X', '*']);
    let width = parts.next().and_then(|value| value.trim().parse::<u32>().ok());
    let height = parts.next().and_then(|value| value.trim().parse::<u32>().ok());
    match (width, height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => (width, height),
        _ => (1024, 1024),
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

fn short_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_uses_file_stem() {
        let asset = MediaAsset::new(vec![1, 2, 3], "image/jpeg", "hong_shao-rou.jpg");
        let text = describe(&asset);
        assert!(text.starts_with("hong shao rou, plated"));
    }

    #[test]
    fn render_is_deterministic_and_small() {
        let first = render("braised pork rice", "1024x768").unwrap();
        let second = render("braised pork rice", "1024x768").unwrap();
        assert_eq!(first, second);
        assert!(first.locator().starts_with("data:image/png;base64,"));

        let RenderedImageRef::Inline { bytes, .. } = first else {
            panic!("dryrun renders inline");
        };
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn parse_dims_falls_back_to_square() {
        assert_eq!(parse_dims("768x1024"), (768, 1024));
        assert_eq!(parse_dims("1024*576"), (1024, 576));
        assert_eq!(parse_dims("large"), (1024, 1024));
    }

    #[test]
    fn complete_echoes_first_line_of_last_user_message() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("\n  写一篇笔记\n第二行"),
        ];
        let text = complete(&messages);
        assert!(text.starts_with("[dryrun "));
        assert!(text.ends_with("写一篇笔记"));
    }
}
