use image::{DynamicImage, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, Blend, Canvas};
use imageproc::rect::Rect;

use crate::adapters::imaging::font::{self, GLYPH_HEIGHT};
use crate::application::ports::RenderPort;
use crate::domain::config::VehicleConfig;
use crate::domain::counts::VehicleCounts;
use crate::domain::detection::Detection;
use crate::domain::errors::DomainResult;

const BOX_THICKNESS: i32 = 2;
const LABEL_ALPHA: u8 = 128; // 0.5
const SUMMARY_ALPHA: u8 = 179; // 0.7
const SUMMARY_ORIGIN: (i32, i32) = (10, 30);
const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Bakes vehicle boxes, score labels and the count summary into a copy of the image.
pub struct Visualizer {
    vehicles: VehicleConfig,
}

impl Visualizer {
    pub fn new(vehicles: VehicleConfig) -> Self {
        Self { vehicles }
    }

    pub fn annotate(&self, image: &RgbImage, detections: &[Detection], counts: &VehicleCounts) -> RgbImage {
        let scale = text_scale(image.width(), image.height());
        let mut canvas = Blend(DynamicImage::ImageRgb8(image.clone()).to_rgba8());

        for det in detections {
            let Some(color) = self.vehicles.color_for(&det.label) else {
                continue;
            };
            let [r, g, b] = color.rgb();

            if let Some(rect) = box_rect(det, image.width(), image.height()) {
                draw_thick_rect(&mut canvas, rect, Rgba([r, g, b, 255]));
            }

            let caption = [det.caption()];
            let (_, label_h) = block_size(&caption, scale);
            let x = det.x1.round() as i32;
            let mut y = det.y1.round() as i32 - label_h as i32;
            if y < 0 {
                y = det.y1.round() as i32;
            }
            draw_text_block(
                &mut canvas,
                &caption,
                (x, y),
                scale,
                Rgba([r, g, b, LABEL_ALPHA]),
            );
        }

        draw_text_block(
            &mut canvas,
            &counts.summary_lines(),
            SUMMARY_ORIGIN,
            scale,
            Rgba([0, 0, 0, SUMMARY_ALPHA]),
        );

        DynamicImage::ImageRgba8(canvas.0).to_rgb8()
    }
}

impl RenderPort for Visualizer {
    fn render(
        &self,
        image: &RgbImage,
        detections: &[Detection],
        counts: &VehicleCounts,
    ) -> DomainResult<RgbImage> {
        Ok(self.annotate(image, detections, counts))
    }
}

/// Glyph scale so overlay text stays legible on large photos.
pub fn text_scale(width: u32, height: u32) -> u32 {
    1 + width.max(height) / 500
}

/// Clamps the detection box to the image; `None` when nothing is left to draw.
fn box_rect(det: &Detection, width: u32, height: u32) -> Option<Rect> {
    if width == 0 || height == 0 || det.width() <= 0.0 || det.height() <= 0.0 {
        return None;
    }
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x1 = det.x1.clamp(0.0, max_x).round() as i32;
    let y1 = det.y1.clamp(0.0, max_y).round() as i32;
    let x2 = det.x2.clamp(0.0, max_x).round() as i32;
    let y2 = det.y2.clamp(0.0, max_y).round() as i32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(Rect::at(x1, y1).of_size((x2 - x1 + 1) as u32, (y2 - y1 + 1) as u32))
}

fn draw_thick_rect(canvas: &mut Blend<RgbaImage>, rect: Rect, color: Rgba<u8>) {
    for offset in 0..BOX_THICKNESS {
        let w = rect.width() as i32 - 2 * offset;
        let h = rect.height() as i32 - 2 * offset;
        if w <= 0 || h <= 0 {
            break;
        }
        let inner = Rect::at(rect.left() + offset, rect.top() + offset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(canvas, inner, color);
    }
}

/// Size of the padded background patch behind `lines`.
fn block_size(lines: &[String], scale: u32) -> (u32, u32) {
    let text_w = lines
        .iter()
        .map(|line| font::text_size(line, scale).0)
        .max()
        .unwrap_or(0);
    let line_h = (GLYPH_HEIGHT + 2) * scale;
    (text_w + 2 * scale, line_h * lines.len() as u32 + 2 * scale)
}

/// White text lines on a translucent background patch anchored at `origin`.
fn draw_text_block(
    canvas: &mut Blend<RgbaImage>,
    lines: &[String],
    origin: (i32, i32),
    scale: u32,
    background: Rgba<u8>,
) {
    let pad = scale as i32;
    let line_h = (GLYPH_HEIGHT + 2) * scale;
    let (block_w, block_h) = block_size(lines, scale);

    if let Some(bg) = clip_rect(origin.0, origin.1, block_w, block_h, canvas.dimensions()) {
        draw_filled_rect_mut(canvas, bg, background);
    }
    for (i, line) in lines.iter().enumerate() {
        let y = origin.1 + pad + i as i32 * line_h as i32 + scale as i32;
        font::draw_text(canvas, line, origin.0 + pad, y, scale, WHITE);
    }
}

/// Intersection of a rectangle with the canvas, if any.
fn clip_rect(x: i32, y: i32, w: u32, h: u32, (cw, ch): (u32, u32)) -> Option<Rect> {
    let left = x.max(0);
    let top = y.max(0);
    let right = (x + w as i32).min(cw as i32);
    let bottom = (y + h as i32).min(ch as i32);
    if right <= left || bottom <= top {
        return None;
    }
    Some(Rect::at(left, top).of_size((right - left) as u32, (bottom - top) as u32))
}
