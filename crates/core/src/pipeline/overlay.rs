//! Detection overlay drawn straight into RGB frames.
//!
//! Labels use a built-in 5x7 bitmap font (uppercase letters, digits, `.`,
//! `-` and space), so annotation needs no font files at runtime.

use crate::shared::constants::OVERLAY_COLOR;
use crate::shared::detection::Detection;
use crate::shared::frame::Frame;

const BOX_THICKNESS: u32 = 2;
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;
/// Gap between the label's bottom edge and the box's top edge.
const LABEL_GAP: u32 = 3;

/// Draws every detection's box and `CLASS 0.87` label onto `frame`.
/// Boxes entirely outside the frame are skipped.
pub fn draw_detections(frame: &mut Frame, detections: &[Detection]) {
    let (width, height) = (frame.width(), frame.height());
    for detection in detections {
        let Some((left, top, right, bottom)) = detection.bbox.to_pixel_rect(width, height) else {
            continue;
        };
        draw_rectangle(frame, left, top, right, bottom, OVERLAY_COLOR);

        let label_y = top.saturating_sub(GLYPH_HEIGHT + LABEL_GAP);
        draw_label(frame, left, label_y, &detection.label(), OVERLAY_COLOR);
    }
}

fn draw_rectangle(frame: &mut Frame, left: u32, top: u32, right: u32, bottom: u32, color: [u8; 3]) {
    for inset in 0..BOX_THICKNESS {
        let (l, t) = (left + inset, top + inset);
        let (Some(r), Some(b)) = (right.checked_sub(inset), bottom.checked_sub(inset)) else {
            break;
        };
        if r < l || b < t {
            break;
        }
        for x in l..=r {
            frame.set_pixel(x, t, color);
            frame.set_pixel(x, b, color);
        }
        for y in t..=b {
            frame.set_pixel(l, y, color);
            frame.set_pixel(r, y, color);
        }
    }
}

/// Renders `text` with its top-left corner at `(x, y)`. Pixels falling
/// outside the frame are dropped; unknown characters render as blanks.
fn draw_label(frame: &mut Frame, x: u32, y: u32, text: &str, color: [u8; 3]) {
    let mut pen_x = x;
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        frame.set_pixel(pen_x + col, y + row as u32, color);
                    }
                }
            }
        }
        pen_x = pen_x.saturating_add(GLYPH_ADVANCE);
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
