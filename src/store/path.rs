use crate::error::{Code, Error, Result};

/// Normalizes a catalog directory path relative to a backend root.
///
/// The result never has a leading or trailing separator and the root itself
/// normalizes to `"."`.
pub fn normalize_path(path: &str, separator: char) -> Result<String> {
    let path = path.trim();

    let segments: Vec<&str> = path
        .trim_matches(separator)
        .split(separator)
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();

    if segments.is_empty() {
        return Ok(".".to_string());
    }

    for segment in &segments {
        validate_segment(segment)?;
    }

    Ok(segments.join(&separator.to_string()))
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment == ".." {
        return Err(
            Error::new("966be6fe-b84a-4009-84c4-6279dd942ecd", Code::InvalidArgument, "Path escapes the backend root.")
                .with_meta("segment", segment),
        );
    }

    if segment.len() > 255 {
        return Err(Error::new(
            "5490de2f-4a65-4488-a651-daebb3477903",
            Code::InvalidArgument,
            "Path segment cannot exceed 255 characters.",
        ));
    }

    const INVALID_CHARS: &[char] = &['\0', '\n', '\r'];
    if segment.chars().any(|c| INVALID_CHARS.contains(&c)) {
        return Err(Error::new(
            "14eb977d-8742-4c90-b2ce-c3eb958f4fad",
            Code::InvalidArgument,
            "Path segment contains invalid characters.",
        ));
    }

    Ok(())
}

/// Digest identifying an object within its directory and file type.
#[must_use]
pub fn object_hash(relative_path: &str) -> [u8; 16] {
    let trimmed = relative_path.trim_start_matches('/');
    xxhash_rust::xxh3::xxh3_128(trimmed.as_bytes()).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_basic() {
        assert_eq!(normalize_path("deliveries", '/').unwrap(), "deliveries");
        assert_eq!(normalize_path("/deliveries", '/').unwrap(), "deliveries");
        assert_eq!(normalize_path("deliveries/", '/').unwrap(), "deliveries");
        assert_eq!(normalize_path("/deliveries/", '/').unwrap(), "deliveries");
    }

    #[test]
    fn test_normalize_path_nested() {
        assert_eq!(
            normalize_path("//deliveries//2024/./06//", '/').unwrap(),
            "deliveries/2024/06"
        );
    }

    #[test]
    fn test_normalize_path_root() {
        assert_eq!(normalize_path("", '/').unwrap(), ".");
        assert_eq!(normalize_path("/", '/').unwrap(), ".");
        assert_eq!(normalize_path("./", '/').unwrap(), ".");
    }

    #[test]
    fn test_normalize_path_rejects_parent() {
        let err = normalize_path("deliveries/../etc", '/').unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(normalize_path("bad\nname", '/').is_err());
    }

    #[test]
    fn test_object_hash_ignores_leading_slash() {
        assert_eq!(object_hash("/a/b.zip"), object_hash("a/b.zip"));
        assert_ne!(object_hash("a/b.zip"), object_hash("a/c.zip"));
    }
}
