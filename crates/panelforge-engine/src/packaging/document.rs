use std::io::Write;

use image::codecs::jpeg::JpegEncoder;
use tracing::warn;

use crate::error::ForgeError;

pub const PAGE_DPI: f32 = 100.0;
const JPEG_QUALITY: u8 = 90;

struct PdfPage {
    jpeg: Vec<u8>,
    width_px: u32,
    height_px: u32,
}

/// One page per decodable image, in order, each sized to the image at
/// `PAGE_DPI`. Images that fail to decode are skipped.
pub fn build_document(images: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ForgeError> {
    let mut pages = Vec::with_capacity(images.len());
    for (name, bytes) in images {
        match jpeg_page(bytes) {
            Ok(page) => pages.push(page),
            Err(err) => warn!(file_name = %name, error = %err, "skipping undecodable image"),
        }
    }
    if pages.is_empty() {
        return Err(ForgeError::NotFound("no decodable images".to_string()));
    }
    Ok(render_pdf(&pages))
}

fn jpeg_page(bytes: &[u8]) -> Result<PdfPage, image::ImageError> {
    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(PdfPage {
        width_px: rgb.width(),
        height_px: rgb.height(),
        jpeg,
    })
}

// Object layout: 1 catalog, 2 page tree, then per page (page, contents, image).
fn render_pdf(pages: &[PdfPage]) -> Vec<u8> {
    let mut out: Vec<u8> = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::new();

    let kids = (0..pages.len())
        .map(|idx| format!("{} 0 R", 3 + idx * 3))
        .collect::<Vec<_>>()
        .join(" ");
    push_object(&mut out, &mut offsets, b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
    push_object(
        &mut out,
        &mut offsets,
        format!("<< /Type /Pages /Kids [{kids}] /Count {} >>", pages.len()).into_bytes(),
    );

    for (idx, page) in pages.iter().enumerate() {
        let page_id = 3 + idx * 3;
        let width_pt = page.width_px as f32 * 72.0 / PAGE_DPI;
        let height_pt = page.height_px as f32 * 72.0 / PAGE_DPI;

        push_object(
            &mut out,
            &mut offsets,
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {width_pt:.2} {height_pt:.2}] \
                 /Resources << /XObject << /Im0 {} 0 R >> >> /Contents {} 0 R >>",
                page_id + 2,
                page_id + 1
            )
            .into_bytes(),
        );

        let contents = format!("q {width_pt:.2} 0 0 {height_pt:.2} 0 0 cm /Im0 Do Q");
        let mut stream = format!("<< /Length {} >>\nstream\n", contents.len()).into_bytes();
        stream.extend_from_slice(contents.as_bytes());
        stream.extend_from_slice(b"\nendstream");
        push_object(&mut out, &mut offsets, stream);

        let mut image = format!(
            "<< /Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceRGB \
             /BitsPerComponent 8 /Filter /DCTDecode /Length {} >>\nstream\n",
            page.width_px,
            page.height_px,
            page.jpeg.len()
        )
        .into_bytes();
        image.extend_from_slice(&page.jpeg);
        image.extend_from_slice(b"\nendstream");
        push_object(&mut out, &mut offsets, image);
    }

    let xref_offset = out.len();
    let _ = write!(out, "xref\n0 {}\n0000000000 65535 f \n", offsets.len() + 1);
    for offset in &offsets {
        let _ = write!(out, "{offset:010} 00000 n \n");
    }
    let _ = write!(
        out,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
        offsets.len() + 1
    );
    out
}

fn push_object(out: &mut Vec<u8>, offsets: &mut Vec<usize>, body: Vec<u8>) {
    offsets.push(out.len());
    let id = offsets.len();
    out.extend_from_slice(format!("{id} 0 obj\n").as_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(b"\nendobj\n");
}
