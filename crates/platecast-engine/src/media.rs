use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use platecast_contracts::media::{data_uri, MediaAsset};
use sha2::{Digest, Sha256};

pub const VISION_MAX_DIM: u32 = 1024;

/// Reads an uploaded photo. The MIME type comes from the file's magic bytes
/// and only falls back to the extension when the format is not recognised.
pub fn load_asset(path: &Path) -> Result<MediaAsset> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    let mime = match image::guess_format(&bytes) {
        Ok(format) => format.to_mime_type().to_string(),
        Err(_) => match mime_for_path(path) {
            Some(mime) => mime.to_string(),
            None => bail!("{} is not a recognised image", path.display()),
        },
    };
    let filename = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("upload")
        .to_string();
    Ok(MediaAsset::new(bytes, mime, filename))
}

pub fn fingerprint(asset: &MediaAsset) -> String {
    hex::encode(Sha256::digest(asset.bytes()))
}

/// Downscales and flattens the photo to JPEG before it is embedded in a
/// vision request. Falls back to the original bytes when decoding fails.
pub fn vision_data_uri(asset: &MediaAsset, max_dim: u32) -> String {
    match downscale_jpeg(asset.bytes(), max_dim) {
        Some(bytes) => data_uri("image/jpeg", &bytes),
        None => asset.data_uri(),
    }
}

fn downscale_jpeg(bytes: &[u8], max_dim: u32) -> Option<Vec<u8>> {
    let dim = max_dim.max(128);
    let image = image::load_from_memory(bytes).ok()?;
    let rgba = image.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8 };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    let flattened = DynamicImage::ImageRgba8(flattened);
    let resized = if flattened.width() > dim || flattened.height() > dim {
        flattened.resize(dim, dim, FilterType::Triangle)
    } else {
        flattened
    };
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, 90);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(resized.to_rgb8()))
        .ok()?;
    Some(out)
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "heic" | "heif" => Some("image/heic"),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([180, 90, 40]));
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, 80);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(image))
        .unwrap();
    out
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;

    use super::*;

    #[test]
    fn load_asset_sniffs_mime_from_content() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("dish.png");
        fs::write(&path, sample_jpeg(8, 8))?;
        let asset = load_asset(&path)?;
        assert_eq!(asset.mime_type(), "image/jpeg");
        assert_eq!(asset.filename(), "dish.png");
        assert_eq!(fingerprint(&asset).len(), 64);
        Ok(())
    }

    #[test]
    fn load_asset_rejects_unknown_files() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("notes.txt");
        fs::write(&path, b"hello")?;
        let err = load_asset(&path).unwrap_err();
        assert!(err.to_string().contains("not a recognised image"));

        let empty = temp.path().join("empty.jpg");
        fs::write(&empty, b"")?;
        assert!(load_asset(&empty).is_err());
        Ok(())
    }

    #[test]
    fn vision_data_uri_downscales_large_photos() {
        let asset = MediaAsset::new(sample_jpeg(2000, 1000), "image/jpeg", "big.jpg");
        let uri = vision_data_uri(&asset, 256);
        let encoded = uri.trim_start_matches("data:image/jpeg;base64,");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 256);
        assert_eq!(decoded.height(), 128);
    }

    #[test]
    fn vision_data_uri_keeps_undecodable_bytes() {
        let asset = MediaAsset::new(vec![0, 1, 2, 3], "image/heic", "x.heic");
        assert_eq!(vision_data_uri(&asset, 512), "data:image/heic;base64,AAECAw==");
    }
}
