use std::io::Cursor;
use std::path::{Path, PathBuf};

use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use anyhow::{Context, Result};
use forward_contracts::entries::{EntrySequence, EntryStatus, GeneratedEntry};
use forward_contracts::errors::CollageError;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::draw_text_mut;

use crate::decode_data_uri;

pub const FRAME_WIDTH: u32 = 350;
pub const FRAME_HEIGHT: u32 = 420;
pub const PHOTO_SIZE: u32 = 300;
pub const FRAME_PADDING: u32 = 25;
pub const COLUMNS: u32 = 2;
pub const GRID_GAP: u32 = 50;
pub const TITLE_HEIGHT: u32 = 150;

pub const COLLAGE_FILE_NAME: &str = "future_forward_collage.png";
pub const COLLAGE_TITLE: &str = "Generated with Future Forward";
pub const COLLAGE_BYLINE: &str = "Powered by Google Gemini";

const BACKGROUND: Rgba<u8> = Rgba([255, 251, 240, 255]);
const FRAME_FILL: Rgba<u8> = Rgba([255, 255, 255, 255]);
const INK: Rgba<u8> = Rgba([31, 41, 55, 255]);
const BYLINE_INK: Rgba<u8> = Rgba([107, 114, 128, 255]);

const TITLE_SCALE: f32 = 48.0;
const BYLINE_SCALE: f32 = 24.0;
const CAPTION_SCALE: f32 = 36.0;

const MAX_CANVAS_PIXELS: u64 = 64 * 1024 * 1024;

const FONT_CANDIDATES: [&str; 8] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/freefont/FreeSansBold.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial Unicode.ttf",
];

/// Fixed-grid dimensions for a collage over `count` ready entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollageLayout {
    pub columns: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}

pub fn layout(count: usize) -> CollageLayout {
    let rows = (count as u32).div_ceil(COLUMNS);
    CollageLayout {
        columns: COLUMNS,
        rows,
        width: COLUMNS * FRAME_WIDTH + (COLUMNS + 1) * GRID_GAP,
        height: rows * FRAME_HEIGHT + (rows + 1) * GRID_GAP + TITLE_HEIGHT,
    }
}

fn frame_origin(index: usize) -> (u32, u32) {
    let row = index as u32 / COLUMNS;
    let col = index as u32 % COLUMNS;
    (
        GRID_GAP + col * (FRAME_WIDTH + GRID_GAP),
        TITLE_HEIGHT + GRID_GAP + row * (FRAME_HEIGHT + GRID_GAP),
    )
}

fn within_raster_cap(layout: &CollageLayout) -> bool {
    (layout.width as u64) * (layout.height as u64) <= MAX_CANVAS_PIXELS
}

/// Compose the polaroid grid over every `ready` entry of the sequence.
///
/// All sources are decoded before the first draw call; one unreadable source
/// aborts the whole composition rather than leaving a half-drawn grid.
/// Captions are best-effort: the first system face that parses is used, and
/// with no face at all the grid still renders, captionless.
pub fn compose_collage(sequence: &EntrySequence) -> Result<RgbaImage, CollageError> {
    let ready: Vec<&GeneratedEntry> = sequence
        .iter()
        .filter(|entry| entry.status == EntryStatus::Ready && entry.image_url.is_some())
        .collect();
    if ready.is_empty() {
        return Err(CollageError::NoContent);
    }

    let mut photos = Vec::with_capacity(ready.len());
    for entry in &ready {
        let photo = load_entry_image(entry).map_err(|cause| CollageError::ImageLoad {
            label: entry.label.clone(),
            cause,
        })?;
        photos.push(photo);
    }

    let layout = layout(ready.len());
    if !within_raster_cap(&layout) {
        return Err(CollageError::CanvasUnavailable(format!(
            "{}x{} exceeds the raster cap",
            layout.width, layout.height
        )));
    }
    let mut canvas = RgbaImage::from_pixel(layout.width, layout.height, BACKGROUND);

    let font = load_display_font();
    if let Some(font) = font.as_ref() {
        draw_centered_text(
            &mut canvas,
            INK,
            layout.width / 2,
            GRID_GAP,
            PxScale::from(TITLE_SCALE),
            font,
            COLLAGE_TITLE,
        );
        draw_centered_text(
            &mut canvas,
            BYLINE_INK,
            layout.width / 2,
            GRID_GAP + 60,
            PxScale::from(BYLINE_SCALE),
            font,
            COLLAGE_BYLINE,
        );
    }

    for (index, (entry, photo)) in ready.iter().zip(&photos).enumerate() {
        let (x, y) = frame_origin(index);
        draw_frame_shadow(&mut canvas, x, y);
        fill_rect(&mut canvas, x, y, FRAME_WIDTH, FRAME_HEIGHT, FRAME_FILL);

        let inset = square_photo(photo);
        image::imageops::overlay(
            &mut canvas,
            &inset,
            (x + FRAME_PADDING) as i64,
            (y + FRAME_PADDING) as i64,
        );

        if let Some(font) = font.as_ref() {
            // caption sits centered in the band below the photo
            let band_top = y + FRAME_PADDING + PHOTO_SIZE;
            let caption_y = band_top + (FRAME_HEIGHT - FRAME_PADDING - PHOTO_SIZE) / 2
                - CAPTION_SCALE as u32 / 2;
            draw_centered_text(
                &mut canvas,
                INK,
                x + FRAME_WIDTH / 2,
                caption_y,
                PxScale::from(CAPTION_SCALE),
                font,
                &entry.label,
            );
        }
    }

    Ok(canvas)
}

/// Encode a composed canvas as PNG bytes.
pub fn encode_collage_png(canvas: &RgbaImage) -> Result<Vec<u8>, CollageError> {
    let mut buffer = Cursor::new(Vec::new());
    canvas
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| CollageError::CanvasUnavailable(err.to_string()))?;
    Ok(buffer.into_inner())
}

/// Compose and write the collage PNG under its deterministic name.
pub fn write_collage(sequence: &EntrySequence, out_path: &Path) -> Result<()> {
    let canvas = compose_collage(sequence)?;
    let bytes = encode_collage_png(&canvas)?;
    std::fs::write(out_path, bytes)
        .with_context(|| format!("failed writing collage to {}", out_path.display()))?;
    Ok(())
}

fn load_entry_image(entry: &GeneratedEntry) -> Result<DynamicImage, String> {
    let url = entry.image_url.as_deref().unwrap_or_default();
    if url.starts_with("data:") {
        let (bytes, _mime) = decode_data_uri(url).map_err(|err| format!("{err:#}"))?;
        image::load_from_memory(&bytes).map_err(|err| err.to_string())
    } else {
        image::open(Path::new(url)).map_err(|err| err.to_string())
    }
}

/// Center-crop to a square, then scale to the polaroid inset.
fn square_photo(photo: &DynamicImage) -> RgbaImage {
    let side = photo.width().min(photo.height()).max(1);
    let x = (photo.width() - side) / 2;
    let y = (photo.height() - side) / 2;
    photo
        .crop_imm(x, y, side, side)
        .resize_exact(PHOTO_SIZE, PHOTO_SIZE, FilterType::Lanczos3)
        .to_rgba8()
}

fn draw_frame_shadow(canvas: &mut RgbaImage, x: u32, y: u32) {
    // three translucent rings stand in for a blurred shadow, offset downward
    let rings: [(i64, u8); 3] = [(12, 14), (7, 22), (3, 34)];
    for (spread, alpha) in rings {
        blend_rect(
            canvas,
            x as i64 - spread,
            y as i64 + 5 - spread,
            FRAME_WIDTH as i64 + 2 * spread,
            FRAME_HEIGHT as i64 + 2 * spread,
            alpha,
        );
    }
}

fn fill_rect(canvas: &mut RgbaImage, x: u32, y: u32, width: u32, height: u32, color: Rgba<u8>) {
    for dy in 0..height {
        for dx in 0..width {
            let px = x + dx;
            let py = y + dy;
            if px < canvas.width() && py < canvas.height() {
                canvas.put_pixel(px, py, color);
            }
        }
    }
}

fn blend_rect(canvas: &mut RgbaImage, x: i64, y: i64, width: i64, height: i64, alpha: u8) {
    let a = alpha as f32 / 255.0;
    for dy in 0..height {
        for dx in 0..width {
            let px = x + dx;
            let py = y + dy;
            if px < 0 || py < 0 || px >= canvas.width() as i64 || py >= canvas.height() as i64 {
                continue;
            }
            let pixel = canvas.get_pixel_mut(px as u32, py as u32);
            let r = (pixel[0] as f32 * (1.0 - a)) as u8;
            let g = (pixel[1] as f32 * (1.0 - a)) as u8;
            let b = (pixel[2] as f32 * (1.0 - a)) as u8;
            *pixel = Rgba([r, g, b, 255]);
        }
    }
}

/// Best-effort display face: an explicit `FORWARD_COLLAGE_FONT` first, then
/// common system locations.
fn load_display_font() -> Option<FontVec> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(configured) = std::env::var("FORWARD_COLLAGE_FONT") {
        let configured = configured.trim();
        if !configured.is_empty() {
            candidates.push(PathBuf::from(configured));
        }
    }
    candidates.extend(FONT_CANDIDATES.iter().map(PathBuf::from));

    for candidate in candidates {
        if let Ok(bytes) = std::fs::read(&candidate) {
            if let Ok(font) = FontVec::try_from_vec(bytes) {
                return Some(font);
            }
        }
    }
    None
}

fn draw_centered_text(
    canvas: &mut RgbaImage,
    color: Rgba<u8>,
    center_x: u32,
    top_y: u32,
    scale: PxScale,
    font: &FontVec,
    text: &str,
) {
    let width = measure_text_width(font, scale, text);
    let x = (center_x as f32 - width / 2.0).max(0.0) as i32;
    draw_text_mut(canvas, color, x, top_y as i32, scale, font, text);
}

fn measure_text_width(font: &FontVec, scale: PxScale, text: &str) -> f32 {
    let scaled = font.as_scaled(scale);
    let mut width = 0.0f32;
    let mut prev = None;
    for ch in text.chars() {
        let glyph_id = scaled.glyph_id(ch);
        if let Some(prev_id) = prev {
            width += scaled.kern(prev_id, glyph_id);
        }
        width += scaled.h_advance(glyph_id);
        prev = Some(glyph_id);
    }
    width
}
