//! Address text normalization and point projection.

use std::f64::consts::PI;

/// Half the circumference of the earth in web mercator meters.
const MERCATOR_EXTENT: f64 = 20_037_508.342_789_244;

/// Collapses whitespace and title-cases every word.
#[must_use]
pub fn normalize_address(s: &str) -> String {
    s.split_whitespace()
        .map(initcap)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Upper-cases the first letter of each alphanumeric run and lower-cases the rest.
#[must_use]
pub fn initcap(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_start = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if at_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_start = false;
        } else {
            out.push(c);
            at_start = true;
        }
    }
    out
}

/// Projects a WGS84 point onto web mercator (EPSG:3857).
#[must_use]
pub fn web_mercator(longitude: f64, latitude: f64) -> (f64, f64) {
    let x = longitude * MERCATOR_EXTENT / 180.0;
    let y = ((90.0 + latitude) * PI / 360.0).tan().ln() / (PI / 180.0);
    (x, y * MERCATOR_EXTENT / 180.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("  123  MAIN   ST "), "123 Main St");
        assert_eq!(normalize_address("o'neil AVE"), "O'Neil Ave");
        assert_eq!(normalize_address(""), "");
    }

    #[test]
    fn test_initcap() {
        assert_eq!(initcap("APT"), "Apt");
        assert_eq!(initcap("st-john"), "St-John");
    }

    #[test]
    fn test_web_mercator() {
        let (x, y) = web_mercator(0.0, 0.0);
        assert!(x.abs() < 1e-6);
        assert!(y.abs() < 1e-6);

        let (x, y) = web_mercator(-122.4194, 37.7749);
        assert!((x - -13_627_665.27).abs() < 1.0);
        assert!((y - 4_547_675.35).abs() < 1.0);
    }
}
