//! Stateless helpers shared by the request handlers

use std::str::FromStr;

use crate::api::error::ApiError;

/// Parses and validates Content-Type header for application/json
///
/// Accepts:
/// - `application/json`
/// - `application/json; charset=utf-8`
///
/// Rejects:
/// - `application/jsonp`
/// - `application/json-patch+json`
/// - `text/json`
/// - Malformed media types
pub fn parse_content_type(content_type: &str) -> Result<mime::Mime, ApiError> {
    let media_type: mime::Mime = content_type.parse().map_err(|_| {
        ApiError::InvalidPayload(format!("invalid Content-Type: {}", content_type))
    })?;

    if media_type.type_() != mime::APPLICATION || media_type.subtype() != mime::JSON {
        return Err(ApiError::InvalidPayload(format!(
            "Content-Type must be application/json, got: {}/{}",
            media_type.type_(),
            media_type.subtype()
        )));
    }

    Ok(media_type)
}

/// Validates that body size does not exceed the maximum allowed size
pub fn validate_body_size(data: &[u8], max_size: usize) -> Result<(), ApiError> {
    if data.len() > max_size {
        return Err(ApiError::PayloadTooLarge(data.len()));
    }
    Ok(())
}

/// Parses an optional `?status=` value into a task or worker status
///
/// Blank values are treated as no filter.
pub fn parse_status_filter<S>(raw: Option<&str>) -> Result<Option<S>, ApiError>
where
    S: FromStr<Err = String>,
{
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => S::from_str(&value.to_ascii_lowercase())
            .map(Some)
            .map_err(ApiError::InvalidStatusFilter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskStatus, WorkerStatus};

    #[test]
    fn test_parse_content_type_valid() {
        assert!(parse_content_type("application/json").is_ok());
        assert!(parse_content_type("application/json; charset=utf-8").is_ok());
        assert!(parse_content_type("application/json; charset=UTF-8").is_ok());
    }

    #[test]
    fn test_parse_content_type_invalid() {
        assert!(parse_content_type("application/jsonp").is_err());
        assert!(parse_content_type("application/json-patch+json").is_err());
        assert!(parse_content_type("text/json").is_err());
        assert!(parse_content_type("text/plain").is_err());
        assert!(parse_content_type("invalid").is_err());
        assert!(parse_content_type("").is_err());
    }

    #[test]
    fn test_validate_body_size_ok() {
        let data = vec![0u8; 1000];
        assert!(validate_body_size(&data, 1000).is_ok());
        assert!(validate_body_size(&data, 2000).is_ok());
        assert!(validate_body_size(&[], 100).is_ok());
    }

    #[test]
    fn test_validate_body_size_too_large() {
        let data = vec![0u8; 1000];
        let result = validate_body_size(&data, 999);
        assert!(result.is_err());
        match result {
            Err(ApiError::PayloadTooLarge(size)) => assert_eq!(size, 1000),
            _ => panic!("Expected PayloadTooLarge error"),
        }
    }

    #[test]
    fn test_parse_status_filter() {
        assert_eq!(parse_status_filter::<TaskStatus>(None).unwrap(), None);
        assert_eq!(parse_status_filter::<TaskStatus>(Some("")).unwrap(), None);
        assert_eq!(
            parse_status_filter::<TaskStatus>(Some("Downloading")).unwrap(),
            Some(TaskStatus::Downloading)
        );
        assert_eq!(
            parse_status_filter::<WorkerStatus>(Some("offline")).unwrap(),
            Some(WorkerStatus::Offline)
        );

        match parse_status_filter::<TaskStatus>(Some("queued")) {
            Err(ApiError::InvalidStatusFilter(msg)) => assert!(msg.contains("queued")),
            other => panic!("Expected InvalidStatusFilter, got {other:?}"),
        }
    }
}
