//! Stable label-to-colour assignment for region maps.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::region::OTHERS;

/// Colour for background labels (`others`, `nTNI`).
pub const BACKGROUND: &str = "#d3d3d3";

const BASE: [&str; 20] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#bcbd22", "#17becf",
    "#aec7e8", "#ffbb78", "#98df8a", "#ff9896", "#c5b0d5", "#c49c94", "#f7b6d2", "#dbdb8d", "#9edae5",
    "#393b79", "#637939",
];

fn is_background(label: &str) -> bool {
    label == OTHERS || label == "nTNI"
}

/// HSV with s = 0.65, v = 0.85, hue stepped by the golden angle.
fn generated(k: usize) -> String {
    let h = (k as f64 * 137.507_764) % 360.0 / 60.0;
    let (s, v) = (0.65, 0.85);
    let c = v * s;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    let byte = |u: f64| ((u + m) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", byte(r), byte(g), byte(b))
}

/// Colour per distinct label. Labels are sorted first so the same label set always gets the same
/// colours, whatever order the spots come in.
pub fn palette<'a, I>(labels: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = BTreeMap::new();
    let mut k = 0;
    for label in labels.into_iter().sorted().dedup() {
        let colour = if is_background(label) {
            BACKGROUND.to_string()
        } else {
            let c = BASE.get(k).map(|c| c.to_string()).unwrap_or_else(|| generated(k));
            k += 1;
            c
        };
        out.insert(label.to_string(), colour);
    }
    out
}
