use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use qrcode::render::{svg, unicode};
use qrcode::{EcLevel, QrCode};
use serde::{Deserialize, Serialize};

/// The displayable pairing artifact kept on the instance and sent out in
/// `qrcode.updated` events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QrArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// SVG image as a `data:` URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    pub count: u32,
}

/// Renders a QR payload to an SVG image buffer. Pure: no I/O, same
/// input yields the same bytes.
pub fn render_svg(payload: &str, dark_color: &str) -> Result<Vec<u8>> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::H)?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(264, 264)
        .quiet_zone(true)
        .dark_color(svg::Color(dark_color))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(image.into_bytes())
}

/// Renders a QR payload to a unicode text block for terminal display.
/// Colors are inverted so the code scans on dark terminals.
pub fn render_terminal(payload: &str) -> Result<String> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::H)?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .quiet_zone(true)
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

pub fn svg_data_url(svg_bytes: &[u8]) -> String {
    format!("data:image/svg+xml;base64,{}", BASE64.encode(svg_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svg_rendering_is_deterministic() {
        let a = render_svg("2@abcdef,ghijkl,mnopqr", "#198754").unwrap();
        let b = render_svg("2@abcdef,ghijkl,mnopqr", "#198754").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(b"<?xml"));
    }

    #[test]
    fn dark_color_lands_in_the_image() {
        let svg = render_svg("payload", "#112233").unwrap();
        let text = String::from_utf8(svg).unwrap();
        assert!(text.contains("#112233"));
        assert!(text.contains("#ffffff"));
    }

    #[test]
    fn data_url_is_base64_svg() {
        let url = svg_data_url(b"<svg/>");
        assert!(url.starts_with("data:image/svg+xml;base64,"));
    }

    #[test]
    fn terminal_block_is_multiline() {
        let block = render_terminal("payload").unwrap();
        assert!(block.lines().count() > 10);
    }
}
