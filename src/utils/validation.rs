use crate::utils::error::{MtakError, Result};
use std::path::Path;
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn invalid(field: &str, value: impl ToString, reason: impl Into<String>) -> MtakError {
    MtakError::InvalidConfigValueError {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// REST service base URLs: http or https with a host.
pub fn validate_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value).map_err(|e| invalid(field, value, format!("Not a service URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(
            field,
            value,
            format!("Services are reached over http or https, not {}", url.scheme()),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid(field, value, "Service URL has no host"));
    }
    Ok(())
}

/// Files handed to the uplink or the AUTO proxy must exist before the
/// request is made.
pub fn validate_existing_file(field: &str, path: &str) -> Result<()> {
    if path.trim().is_empty() || path.contains('\0') {
        return Err(invalid(field, path, "Not a usable file name"));
    }
    if !Path::new(path).is_file() {
        return Err(invalid(field, path, "No such file"));
    }
    Ok(())
}

/// Table sizes and retry counts.
pub fn validate_min_count(field: &str, value: usize, min: usize) -> Result<()> {
    if value < min {
        return Err(invalid(field, value, format!("Must be {} or more", min)));
    }
    Ok(())
}

pub fn validate_required_field<'a, T>(field: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| MtakError::MissingConfigError {
        field: field.to_string(),
    })
}

/// A bare host name such as `localhost`, without a scheme or port path.
pub fn validate_host(field: &str, host: &str) -> Result<()> {
    if host.trim().is_empty() {
        return Err(invalid(field, host, "Host name is empty"));
    }
    if host.contains("://") || host.contains('/') || host.chars().any(char::is_whitespace) {
        return Err(invalid(field, host, "Expected a bare host name"));
    }
    Ok(())
}

/// Session keys, entity IDs and virtual channels must be plain digit strings.
pub fn validate_numeric(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(field, value, "Value must contain only digits"));
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(field: &str, value: T, min: T, max: T) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(field, value, format!("Outside {}..={}", min, max)));
    }
    Ok(())
}
