//! Coordinate transformation from normalized field positions to PDF space

use crate::model::Field;

/// US Letter, used when a page carries no readable MediaBox
pub const DEFAULT_MEDIA_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];

/// Rectangle in PDF user space (bottom-left origin, points)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Convert a percentage position (top-left origin) to PDF coordinates.
///
/// `media_box` is `[llx, lly, urx, ury]` as stored in the page dictionary.
pub fn percent_to_pdf(
    x_percent: f64,
    y_percent: f64,
    width_percent: f64,
    height_percent: f64,
    media_box: [f64; 4],
) -> PdfRect {
    let [llx, lly, urx, ury] = media_box;
    let page_width = urx - llx;
    let page_height = ury - lly;

    let width = width_percent / 100.0 * page_width;
    let height = height_percent / 100.0 * page_height;
    let x = llx + x_percent / 100.0 * page_width;
    // Flip Y: the field's top edge is y_percent down from the page top
    let y = ury - y_percent / 100.0 * page_height - height;

    PdfRect {
        x,
        y,
        width,
        height,
    }
}

pub fn field_rect(field: &Field, media_box: [f64; 4]) -> PdfRect {
    percent_to_pdf(
        field.x_percent,
        field.y_percent,
        field.width_percent,
        field.height_percent,
        media_box,
    )
}
