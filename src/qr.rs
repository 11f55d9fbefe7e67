//! QR raster encode / decode around the LPA codec.
//!
//! Encoding renders the exact activation string at error-correction level L
//! (activation codes are short, and L keeps the symbol at the smallest
//! version) with the standard four-module quiet zone.  Decoding tries a
//! luminance pass first and then a pass over the raw colour channels before
//! giving up.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use serde::Serialize;
use tracing::debug;

use crate::config::QrConfig;
use crate::error::{EsimError, Result, ResultExt as _};
use crate::lpa::{self, Extraction, Inspection};

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Render `raw` as a PNG with default options.
pub fn encode(raw: &str) -> Result<Vec<u8>> {
    encode_with(raw, &QrConfig::default())
}

pub fn encode_with(raw: &str, opts: &QrConfig) -> Result<Vec<u8>> {
    let image = render(raw, opts)?;
    let mut png = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .ctx_storage("write PNG")?;
    Ok(png)
}

/// Render `raw` as an in-memory greyscale raster.
pub fn render(raw: &str, opts: &QrConfig) -> Result<GrayImage> {
    if raw.is_empty() {
        return Err(EsimError::Validation("nothing to encode".into()));
    }
    let code = QrCode::with_error_correction_level(raw.as_bytes(), EcLevel::L)
        .ctx_validation("encode QR symbol")?;
    let px = opts.module_px.max(1);
    Ok(code
        .render::<Luma<u8>>()
        .module_dimensions(px, px)
        .quiet_zone(opts.quiet_zone)
        .build())
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Result of scanning an image for a QR symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Found(String),
    /// The image decoded but holds no readable symbol.
    NotFound,
    /// The bytes are not a supported image.
    Malformed(String),
}

pub fn scan(image_bytes: &[u8]) -> ScanOutcome {
    let img = match image::load_from_memory(image_bytes) {
        Ok(img) => img,
        Err(e) => return ScanOutcome::Malformed(format!("unreadable image: {e}")),
    };

    if let Some(text) = decode_luma(&img.to_luma8()) {
        return ScanOutcome::Found(text);
    }
    debug!("greyscale pass found no symbol; retrying on raw channels");
    if let Some(text) = decode_raw_channels(&img) {
        return ScanOutcome::Found(text);
    }
    ScanOutcome::NotFound
}

/// Read the text of the first QR symbol in `image_bytes`.
pub fn decode(image_bytes: &[u8]) -> Result<String> {
    match scan(image_bytes) {
        ScanOutcome::Found(text) => Ok(text),
        ScanOutcome::NotFound => Err(EsimError::Decode(
            "no QR code found in image".into(),
        )),
        ScanOutcome::Malformed(reason) => Err(EsimError::Decode(reason)),
    }
}

/// Decode and classify in one step.  The caller decides what to do with the
/// classification.
pub fn read_activation(image_bytes: &[u8]) -> Result<Extraction> {
    decode(image_bytes).map(|text| lpa::extract(&text))
}

fn decode_luma(gray: &GrayImage) -> Option<String> {
    let (w, h) = gray.dimensions();
    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
        w as usize,
        h as usize,
        |x, y| gray.get_pixel(x as u32, y as u32)[0],
    );
    prepared
        .detect_grids()
        .into_iter()
        .find_map(|grid| grid.decode().ok().map(|(_, content)| content))
}

/// Second pass: darkest colour channel, composited over white.  Catches
/// tinted symbols whose luminance contrast is too low for the first pass.
fn decode_raw_channels(img: &DynamicImage) -> Option<String> {
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut prepared =
        rqrr::PreparedImage::prepare_from_greyscale(w as usize, h as usize, |x, y| {
            let [r, g, b, a] = rgba.get_pixel(x as u32, y as u32).0;
            let darkest = r.min(g).min(b) as u16;
            let alpha = a as u16;
            // Transparent pixels read as white paper.
            ((darkest * alpha + 255 * (255 - alpha)) / 255) as u8
        });
    prepared
        .detect_grids()
        .into_iter()
        .find_map(|grid| grid.decode().ok().map(|(_, content)| content))
}

// ---------------------------------------------------------------------------
// Image analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ImageAnalysis {
    pub qr_detected: bool,
    pub inspection: Option<Inspection>,
    pub error: Option<String>,
}

/// Decode an image and describe its content.  Never fails.
pub fn analyze(image_bytes: &[u8]) -> ImageAnalysis {
    match decode(image_bytes) {
        Ok(text) => ImageAnalysis {
            qr_detected: true,
            inspection: Some(lpa::inspect(&text)),
            error: None,
        },
        Err(e) => ImageAnalysis {
            qr_detected: false,
            inspection: None,
            error: Some(e.reason()),
        },
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
