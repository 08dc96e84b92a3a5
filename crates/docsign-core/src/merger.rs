//! Render recipient annotations onto the base document.
//!
//! Every annotation becomes a Stamp annotation whose normal appearance is a
//! Form XObject, so viewers show it without re-rendering form fields. Nothing
//! time-dependent is written: the same inputs always produce the same bytes.

use std::collections::BTreeMap;
use std::io::Write;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::{write::ZlibEncoder, Compression};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use tracing::debug;

use crate::coords::{field_rect, PdfRect, DEFAULT_MEDIA_BOX};
use crate::error::MergeError;
use crate::model::{Annotation, AnnotationData, Field};

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Largest accepted signature image edge, in pixels
pub const MAX_IMAGE_DIMENSION: u32 = 4096;

/// A decoded signature image, normalized to 8-bit RGB plus optional alpha
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
    pub alpha: Option<Vec<u8>>,
}

/// Decode a `data:image/png;base64,...` URL into raw pixels
pub fn decode_png_data_url(url: &str) -> Result<DecodedImage, String> {
    let encoded = url
        .strip_prefix(PNG_DATA_URL_PREFIX)
        .ok_or_else(|| "drawn signature must be a PNG data URL".to_string())?;
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| format!("invalid base64 in image: {}", e))?;

    let mut decoder = png::Decoder::new(bytes.as_slice());
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder
        .read_info()
        .map_err(|e| format!("invalid PNG: {}", e))?;

    let (width, height) = {
        let info = reader.info();
        (info.width, info.height)
    };
    if width == 0 || height == 0 || width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
        return Err(format!(
            "image is {}x{}, each side must be 1..={} pixels",
            width, height, MAX_IMAGE_DIMENSION
        ));
    }

    let mut buf = vec![0; reader.output_buffer_size()];
    let frame = reader
        .next_frame(&mut buf)
        .map_err(|e| format!("invalid PNG: {}", e))?;
    let data = &buf[..frame.buffer_size()];

    let pixels = (width * height) as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    let mut alpha = Vec::new();

    match frame.color_type {
        png::ColorType::Rgb => rgb.extend_from_slice(data),
        png::ColorType::Rgba => {
            for px in data.chunks_exact(4) {
                rgb.extend_from_slice(&px[..3]);
                alpha.push(px[3]);
            }
        }
        png::ColorType::Grayscale => {
            for &g in data {
                rgb.extend_from_slice(&[g, g, g]);
            }
        }
        png::ColorType::GrayscaleAlpha => {
            for px in data.chunks_exact(2) {
                rgb.extend_from_slice(&[px[0], px[0], px[0]]);
                alpha.push(px[1]);
            }
        }
        png::ColorType::Indexed => {
            return Err("indexed PNG was not expanded".to_string());
        }
    }

    if rgb.len() != pixels * 3 {
        return Err("PNG pixel data is truncated".to_string());
    }

    Ok(DecodedImage {
        width,
        height,
        rgb,
        alpha: if alpha.is_empty() { None } else { Some(alpha) },
    })
}

/// Number of pages in a PDF, used to validate field placement up front
pub fn page_count(pdf_bytes: &[u8]) -> Result<u32, MergeError> {
    let doc = Document::load_mem(pdf_bytes).map_err(|e| MergeError::ParseError(e.to_string()))?;
    Ok(doc.get_pages().len() as u32)
}

/// Produce the final document from the base document and annotations.
///
/// Annotations are drawn in list order. With no annotations the base
/// document is returned byte-for-byte.
pub fn merge(
    base_document: &[u8],
    annotations: &[Annotation],
    fields: &[Field],
) -> Result<Vec<u8>, MergeError> {
    if annotations.is_empty() {
        return Ok(base_document.to_vec());
    }

    let mut doc =
        Document::load_mem(base_document).map_err(|e| MergeError::ParseError(e.to_string()))?;
    let pages: BTreeMap<u32, ObjectId> = doc.get_pages();

    for annotation in annotations {
        let field = fields
            .iter()
            .find(|f| f.id == annotation.field_id)
            .ok_or_else(|| MergeError::InvalidAnnotation {
                field_id: annotation.field_id.clone(),
                reason: "field no longer exists".into(),
            })?;
        let page_id = *pages
            .get(&field.page)
            .ok_or(MergeError::MissingPage { page: field.page })?;

        let rect = field_rect(field, media_box(&doc, page_id));
        render_annotation(&mut doc, page_id, &rect, field, &annotation.data)?;
    }

    debug!(
        "Merged {} annotation(s) onto {} page document",
        annotations.len(),
        pages.len()
    );

    let mut output = Vec::new();
    doc.save_to(&mut output)
        .map_err(|e| MergeError::OperationError(e.to_string()))?;
    Ok(output)
}

fn render_annotation(
    doc: &mut Document,
    page_id: ObjectId,
    rect: &PdfRect,
    field: &Field,
    data: &AnnotationData,
) -> Result<(), MergeError> {
    let appearance = match data {
        AnnotationData::DrawnSignature { image } => {
            let decoded =
                decode_png_data_url(image).map_err(|reason| MergeError::InvalidAnnotation {
                    field_id: field.id.clone(),
                    reason,
                })?;
            image_appearance(doc, rect, &decoded)?
        }
        AnnotationData::TypedSignature { text, font } => {
            text_appearance(rect, text, base_font_for(font), 36.0)
        }
        AnnotationData::Text { value } | AnnotationData::Date { value } => {
            text_appearance(rect, value, "Helvetica", 14.0)
        }
        AnnotationData::Checkbox { checked } => checkbox_appearance(rect, *checked),
    };

    let ap_stream_id = doc.add_object(appearance);
    let annot = dictionary! {
        "Type" => "Annot",
        "Subtype" => "Stamp",
        "Rect" => rect_array(rect),
        "F" => 4,
        "NM" => Object::string_literal(field.id.as_str()),
        "P" => Object::Reference(page_id),
        "AP" => dictionary! { "N" => Object::Reference(ap_stream_id) },
    };
    let annot_id = doc.add_object(Object::Dictionary(annot));
    add_annotation_to_page(doc, page_id, annot_id)
}

fn rect_array(rect: &PdfRect) -> Object {
    Object::Array(vec![
        Object::Real(rect.x as f32),
        Object::Real(rect.y as f32),
        Object::Real((rect.x + rect.width) as f32),
        Object::Real((rect.y + rect.height) as f32),
    ])
}

fn bbox(width: f64, height: f64) -> Object {
    Object::Array(vec![
        Object::Integer(0),
        Object::Integer(0),
        Object::Real(width as f32),
        Object::Real(height as f32),
    ])
}

// ============================================================
// Appearance streams
// ============================================================

/// Map a requested font family onto one of the standard 14 fonts
fn base_font_for(font: &str) -> &'static str {
    let font = font.to_lowercase();
    if font.contains("courier") || font.contains("mono") {
        "Courier-Oblique"
    } else if font.contains("helvetica") || font.contains("arial") || font.contains("sans") {
        "Helvetica-Oblique"
    } else {
        // Script and handwriting faces
        "Times-Italic"
    }
}

fn text_appearance(rect: &PdfRect, text: &str, base_font: &str, max_size: f64) -> Object {
    let escaped = escape_pdf_string(text);
    let chars = text.chars().count().max(1) as f64;
    // Standard fonts average about half an em per glyph
    let fit_width = (rect.width - 4.0).max(1.0) / (chars * 0.5);
    let font_size = (rect.height * 0.7).min(fit_width).clamp(4.0, max_size);
    let text_y = ((rect.height - font_size) / 2.0).max(0.0) + font_size * 0.2;

    let content = format!(
        "q\n0 0 0 rg\nBT\n/F1 {fs:.2} Tf\n2 {ty:.2} Td\n({text}) Tj\nET\nQ",
        fs = font_size,
        ty = text_y,
        text = escaped,
    );

    let font = dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => base_font,
        "Encoding" => "WinAnsiEncoding",
    };
    let resources = dictionary! {
        "Font" => dictionary! { "F1" => font },
    };
    form_xobject(rect.width, rect.height, resources, content.into_bytes())
}

fn checkbox_appearance(rect: &PdfRect, checked: bool) -> Object {
    let size = rect.width.min(rect.height);
    let checkmark = if checked {
        format!(
            "q\n0 G\n{lw:.2} w\n{x1:.2} {y1:.2} m\n{x2:.2} {y2:.2} l\n{x3:.2} {y3:.2} l\nS\nQ",
            lw = (size * 0.1).max(1.0),
            x1 = size * 0.2,
            y1 = size * 0.5,
            x2 = size * 0.4,
            y2 = size * 0.3,
            x3 = size * 0.8,
            y3 = size * 0.8,
        )
    } else {
        String::new()
    };

    let content = format!(
        "q\n1 1 1 rg\n0 0 {s:.2} {s:.2} re f\n0 0 0 RG\n1 w\n0 0 {s:.2} {s:.2} re S\n{check}\nQ",
        s = size,
        check = checkmark,
    );
    form_xobject(rect.width, rect.height, Dictionary::new(), content.into_bytes())
}

fn image_appearance(
    doc: &mut Document,
    rect: &PdfRect,
    image: &DecodedImage,
) -> Result<Object, MergeError> {
    let mut image_dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => i64::from(image.width),
        "Height" => i64::from(image.height),
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => 8,
        "Filter" => "FlateDecode",
    };

    if let Some(ref alpha) = image.alpha {
        let smask = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(image.width),
            "Height" => i64::from(image.height),
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        };
        let smask_id = doc.add_object(Stream::new(smask, deflate(alpha)?));
        image_dict.set("SMask", Object::Reference(smask_id));
    }
    let image_id = doc.add_object(Stream::new(image_dict, deflate(&image.rgb)?));

    // Fit inside the field, keeping the aspect ratio, centered
    let scale = (rect.width / f64::from(image.width)).min(rect.height / f64::from(image.height));
    let draw_w = f64::from(image.width) * scale;
    let draw_h = f64::from(image.height) * scale;
    let offset_x = (rect.width - draw_w) / 2.0;
    let offset_y = (rect.height - draw_h) / 2.0;

    let content = format!(
        "q\n{w:.4} 0 0 {h:.4} {x:.4} {y:.4} cm\n/Im1 Do\nQ",
        w = draw_w,
        h = draw_h,
        x = offset_x,
        y = offset_y,
    );
    let resources = dictionary! {
        "XObject" => dictionary! { "Im1" => Object::Reference(image_id) },
    };
    Ok(form_xobject(
        rect.width,
        rect.height,
        resources,
        content.into_bytes(),
    ))
}

fn form_xobject(width: f64, height: f64, resources: Dictionary, content: Vec<u8>) -> Object {
    let dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Form",
        "FormType" => 1,
        "BBox" => bbox(width, height),
        "Resources" => resources,
    };
    Object::Stream(Stream::new(dict, content))
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, MergeError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| MergeError::OperationError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| MergeError::OperationError(e.to_string()))
}

/// Escape a string for a PDF literal drawn with a WinAnsiEncoding font.
///
/// Characters outside the encoding are replaced with `?`.
fn escape_pdf_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\\' => out.push_str("\\\\"),
            '\n' | '\r' => out.push(' '),
            _ if c.is_ascii() => out.push(c),
            _ => match win_ansi_code(c) {
                Some(code) => out.push_str(&format!("\\{:03o}", code)),
                None => out.push('?'),
            },
        }
    }
    out
}

/// WinAnsiEncoding byte for a non-ASCII character
fn win_ansi_code(c: char) -> Option<u8> {
    match c {
        '\u{a0}'..='\u{ff}' => Some(c as u8),
        '\u{20ac}' => Some(0x80),
        '\u{2018}' => Some(0x91),
        '\u{2019}' => Some(0x92),
        '\u{201c}' => Some(0x93),
        '\u{201d}' => Some(0x94),
        '\u{2022}' => Some(0x95),
        '\u{2013}' => Some(0x96),
        '\u{2014}' => Some(0x97),
        _ => None,
    }
}

// ============================================================
// Page helpers
// ============================================================

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

/// MediaBox of a page, following inheritance through the page tree
fn media_box(doc: &Document, page_id: ObjectId) -> [f64; 4] {
    let mut current = Some(page_id);
    // The page tree is shallow; the bound protects against Parent cycles
    for _ in 0..16 {
        let Some(id) = current else { break };
        let Ok(dict) = doc.get_dictionary(id) else {
            break;
        };
        if let Ok(obj) = dict.get(b"MediaBox") {
            if let Object::Array(values) = resolve(doc, obj) {
                let nums: Vec<f64> = values
                    .iter()
                    .filter_map(|v| number(resolve(doc, v)))
                    .collect();
                if let &[llx, lly, urx, ury] = nums.as_slice() {
                    if urx > llx && ury > lly {
                        return [llx, lly, urx, ury];
                    }
                }
            }
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    DEFAULT_MEDIA_BOX
}

fn add_annotation_to_page(
    doc: &mut Document,
    page_id: ObjectId,
    annot_id: ObjectId,
) -> Result<(), MergeError> {
    // Annots may live in a separate array object
    let indirect = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|page| page.get(b"Annots").ok())
        .and_then(|annots| annots.as_reference().ok());

    if let Some(array_id) = indirect {
        if let Ok(Object::Array(ref mut arr)) = doc.get_object_mut(array_id) {
            arr.push(Object::Reference(annot_id));
            return Ok(());
        }
    }

    let page = doc
        .get_object_mut(page_id)
        .map_err(|e| MergeError::OperationError(e.to_string()))?;
    if let Object::Dictionary(ref mut page_dict) = page {
        if let Ok(Object::Array(ref mut arr)) = page_dict.get_mut(b"Annots") {
            arr.push(Object::Reference(annot_id));
        } else {
            page_dict.set("Annots", Object::Array(vec![Object::Reference(annot_id)]));
        }
    }
    Ok(())
}
