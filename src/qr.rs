use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use qrcode::QrCode;
use qrcode::render::svg;
use qrcode::types::QrError;

/// Render a pairing code as an SVG data URL suitable for an `<img>` tag.
/// The CRM stores this string verbatim in the session row.
pub fn qr_data_url(code: &str) -> Result<String, QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    let svg = qr
        .render()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        BASE64.encode(svg.as_bytes())
    ))
}
