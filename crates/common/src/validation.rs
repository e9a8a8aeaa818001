//! Input validation utilities shared by the recognition node and its adapters
//!
//! Everything that crosses a process boundary (camera ids coming from the
//! registry, source URIs handed to ffmpeg, thresholds read from the
//! environment) goes through one of these checks before it is used.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;

// ============================================================================
// CONSTANTS: Input Size Limits
// ============================================================================

/// Maximum length for resource IDs (camera_id, identity_id, node_id)
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length for camera source URIs (RTSP, HTTP, file paths)
pub const MAX_URI_LENGTH: usize = 4096;

/// Maximum length for display labels
pub const MAX_LABEL_LENGTH: usize = 512;

// ============================================================================
// String Validation
// ============================================================================

/// Validate string length against a maximum
pub fn validate_length(value: &str, max_length: usize, field_name: &str) -> Result<()> {
    if value.len() > max_length {
        return Err(anyhow!(
            "{} exceeds maximum length of {} bytes (got {})",
            field_name,
            max_length,
            value.len()
        ));
    }
    Ok(())
}

/// Validate non-empty string
pub fn validate_non_empty(value: &str, field_name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} cannot be empty", field_name));
    }
    Ok(())
}

/// Validate resource ID (camera_id, identity_id, etc.)
pub fn validate_id(id: &str, field_name: &str) -> Result<()> {
    validate_non_empty(id, field_name)?;
    validate_length(id, MAX_ID_LENGTH, field_name)?;

    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(anyhow!(
            "{} contains invalid characters (no path separators or '..' allowed)",
            field_name
        ));
    }

    Ok(())
}

/// Validate a display label
pub fn validate_label(label: &str, field_name: &str) -> Result<()> {
    validate_non_empty(label, field_name)?;
    validate_length(label, MAX_LABEL_LENGTH, field_name)?;
    Ok(())
}

/// Validate a camera source URI before it is handed to an external process
pub fn validate_uri(uri: &str, field_name: &str) -> Result<()> {
    validate_non_empty(uri, field_name)?;
    validate_length(uri, MAX_URI_LENGTH, field_name)?;

    // Prevent shell metacharacters (command injection)
    let dangerous_chars = ['`', '$', ';', '|', '&', '\n', '\r'];
    if uri.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!(
            "{} contains dangerous shell metacharacters",
            field_name
        ));
    }

    Ok(())
}

// ============================================================================
// Numeric Validation
// ============================================================================

/// Validate value is within range (inclusive)
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field_name: &str,
) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "{} must be between {} and {}, got {}",
            field_name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

/// Validate a score or ratio that must lie in [0, 1]
pub fn validate_unit_interval(value: f32, field_name: &str) -> Result<()> {
    if !value.is_finite() {
        return Err(anyhow!("{} must be a finite number, got {}", field_name, value));
    }
    validate_range(value, 0.0, 1.0, field_name)
}

/// Validate positive duration in milliseconds
pub fn validate_duration_ms(ms: u64, field_name: &str) -> Result<()> {
    if ms == 0 {
        return Err(anyhow!("{} must be greater than 0", field_name));
    }
    Ok(())
}

// ============================================================================
// Calendar days
// ============================================================================

/// Parse a calendar day in `YYYY-MM-DD` form
pub fn parse_day(value: &str, field_name: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").with_context(|| {
        format!(
            "{} is not a valid date: '{}' (expected format: YYYY-MM-DD)",
            field_name, value
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("cam-lobby-1", "camera_id").is_ok());
        assert!(validate_id("student_42", "identity_id").is_ok());

        assert!(validate_id("", "id").is_err());
        assert!(validate_id("  ", "id").is_err());
        assert!(validate_id("../etc/passwd", "id").is_err());
        assert!(validate_id("a/b", "id").is_err());
        assert!(validate_id(&"a".repeat(300), "id").is_err());
    }

    #[test]
    fn test_validate_uri() {
        assert!(validate_uri("rtsp://camera.local/stream", "uri").is_ok());
        assert!(validate_uri("http://10.0.0.12:8080/snapshot.jpg", "uri").is_ok());

        assert!(validate_uri("rtsp://cam`whoami`.local", "uri").is_err());
        assert!(validate_uri("http://example.com;rm -rf /", "uri").is_err());
        assert!(validate_uri("rtsp://cam$(id).local", "uri").is_err());
        assert!(validate_uri(&"a".repeat(5000), "uri").is_err());
    }

    #[test]
    fn test_validate_unit_interval() {
        assert!(validate_unit_interval(0.0, "threshold").is_ok());
        assert!(validate_unit_interval(0.55, "threshold").is_ok());
        assert!(validate_unit_interval(1.0, "threshold").is_ok());

        assert!(validate_unit_interval(-0.1, "threshold").is_err());
        assert!(validate_unit_interval(1.5, "threshold").is_err());
        assert!(validate_unit_interval(f32::NAN, "threshold").is_err());
    }

    #[test]
    fn test_validate_duration_ms() {
        assert!(validate_duration_ms(1, "cadence").is_ok());
        assert!(validate_duration_ms(0, "cadence").is_err());
    }

    #[test]
    fn test_parse_day() {
        let day = parse_day("2026-03-14", "date").unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());

        assert!(parse_day("14/03/2026", "date").is_err());
        assert!(parse_day("2026-02-30", "date").is_err());
    }
}
