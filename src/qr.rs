//! QR code rendering for table stickers and ticket emails.

use base64::Engine;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use qrcode::{types::Color, QrCode};
use std::io::Cursor;

use crate::error::{PosError, Result};

/// Pixels per QR module.
pub const DEFAULT_SCALE: u32 = 8;
/// Quiet zone, in modules.
pub const DEFAULT_MARGIN: u32 = 4;

/// Render `data` as a grayscale PNG.
pub fn render_png(data: &str, scale: u32, margin: u32) -> Result<Vec<u8>> {
    let scale = scale.max(1);
    let code = QrCode::new(data.as_bytes())
        .map_err(|e| PosError::Internal(format!("QR encoding failed: {e}")))?;
    let module_count = code.width() as u32;
    let image_size = (module_count + margin * 2) * scale;
    let mut img = ImageBuffer::from_pixel(image_size, image_size, Luma([255u8]));
    let colors = code.to_colors();

    for y in 0..module_count {
        for x in 0..module_count {
            if colors[(y * module_count + x) as usize] != Color::Dark {
                continue;
            }
            let x0 = (x + margin) * scale;
            let y0 = (y + margin) * scale;
            for dy in 0..scale {
                for dx in 0..scale {
                    img.put_pixel(x0 + dx, y0 + dy, Luma([0u8]));
                }
            }
        }
    }

    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| PosError::Internal(format!("PNG encoding failed: {e}")))?;
    Ok(buf.into_inner())
}

/// `data:image/png;base64,...` URL for embedding in JSON responses.
pub fn data_url(data: &str) -> Result<String> {
    let png = render_png(data, DEFAULT_SCALE, DEFAULT_MARGIN)?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    ))
}
