//! Icon validation
//!
//! Icons are small monochrome SVGs that clients tint to match their theme,
//! so geometry is fixed and every paint must defer to `currentColor`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

use crate::validation::{Findings, ViolationKind};

/// Canonical icon edge length in px
pub const ICON_SIZE: f64 = 16.0;

/// Paint values allowed on any paint-bearing attribute
pub const ALLOWED_PAINTS: &[&str] = &["currentcolor", "none"];

/// Attributes and CSS properties that carry paint
pub const PAINT_PROPERTIES: &[&str] = &[
    "fill",
    "stroke",
    "stop-color",
    "flood-color",
    "lighting-color",
    "color",
];

static SVG_ROOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<svg\b[^>]*>").expect("static regex"));

static ROOT_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\swidth\s*=\s*["']\s*([\d.]+)(?:px)?\s*["']"#).expect("static regex"));

static ROOT_HEIGHT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\sheight\s*=\s*["']\s*([\d.]+)(?:px)?\s*["']"#).expect("static regex"));

static VIEW_BOX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"viewBox\s*=\s*["']\s*[-\d.]+[\s,]+[-\d.]+[\s,]+([\d.]+)[\s,]+([\d.]+)\s*["']"#)
        .expect("static regex")
});

static PAINT_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\s(fill|stroke|stop-color|flood-color|lighting-color|color)\s*=\s*(?:"([^"]*)"|'([^']*)')"#,
    )
    .expect("static regex")
});

static STYLE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\sstyle\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("static regex"));

static STYLE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<style\b[^>]*>(.*?)</style>").expect("static regex"));

/// Validate `icon.svg`; `None` (no icon) is always valid
pub fn validate_icon(path: Option<&Path>) -> Findings {
    let mut findings = Findings::default();
    let Some(path) = path else {
        return findings;
    };

    let is_svg = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("svg"))
        .unwrap_or(false);
    if !is_svg {
        findings.violation(
            ViolationKind::Icon,
            format!("Icon must be an SVG file: {}", path.display()),
        );
        return findings;
    }

    match fs::read_to_string(path) {
        Ok(content) => findings.extend(validate_svg(&content)),
        Err(e) => findings.violation(ViolationKind::Icon, format!("Cannot read icon: {}", e)),
    }
    findings
}

/// Validate SVG source text
pub fn validate_svg(content: &str) -> Findings {
    let mut findings = Findings::default();

    let Some(root) = SVG_ROOT.find(content) else {
        findings.violation(ViolationKind::Icon, "Icon is not an SVG document (no <svg> element)");
        return findings;
    };

    check_geometry(root.as_str(), &mut findings);
    check_paints(content, &mut findings);

    findings
}

fn capture_number(re: &Regex, text: &str) -> Option<f64> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

fn check_geometry(root: &str, findings: &mut Findings) {
    let explicit = capture_number(&ROOT_WIDTH, root).zip(capture_number(&ROOT_HEIGHT, root));
    let view_box = || {
        let caps = VIEW_BOX.captures(root)?;
        let w = caps.get(1)?.as_str().parse::<f64>().ok()?;
        let h = caps.get(2)?.as_str().parse::<f64>().ok()?;
        Some((w, h))
    };

    let Some((width, height)) = explicit.or_else(view_box) else {
        findings.violation(ViolationKind::Icon, "Icon missing width/height attributes and viewBox");
        return;
    };

    if width != height {
        findings.violation(
            ViolationKind::Icon,
            format!("Icon must be square (got {}x{})", width, height),
        );
    } else if width != ICON_SIZE {
        findings.violation(
            ViolationKind::Icon,
            format!(
                "Icon must be {}x{} (got {}x{})",
                ICON_SIZE, ICON_SIZE, width, height
            ),
        );
    }
}

fn is_allowed_paint(value: &str) -> bool {
    let normalized = value.trim().trim_end_matches("!important").trim().to_lowercase();
    ALLOWED_PAINTS.contains(&normalized.as_str())
}

fn check_paints(content: &str, findings: &mut Findings) {
    for caps in PAINT_ATTR.captures_iter(content) {
        let property = &caps[1];
        let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
        if !is_allowed_paint(value) {
            findings.violation(
                ViolationKind::Icon,
                format!("Icon {}=\"{}\" must be currentColor or none", property, value),
            );
        }
    }

    let inline = STYLE_ATTR
        .captures_iter(content)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str());
    let blocks = STYLE_BLOCK
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str());

    for css in inline.chain(blocks) {
        for declaration in css.split(|c| c == ';' || c == '{' || c == '}') {
            let Some((property, value)) = declaration.split_once(':') else {
                continue;
            };
            let property = property.trim().to_lowercase();
            if PAINT_PROPERTIES.contains(&property.as_str()) && !is_allowed_paint(value) {
                findings.violation(
                    ViolationKind::Icon,
                    format!("Icon style {}: {} must be currentColor or none", property, value.trim()),
                );
            }
        }
    }
}
