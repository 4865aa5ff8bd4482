use thiserror::Error;

use super::models::{CreateTaskRequest, TaskReport};
use crate::model::TAGS_OPTION;

const MAX_URL_LEN: usize = 4096;
const MAX_TAGS: usize = 32;
const MAX_TAG_LEN: usize = 256;
const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "ftp", "sftp", "magnet"];

#[derive(Debug, Error, PartialEq)]
pub enum TaskValidationError {
    #[error("url is required")]
    MissingUrl,
    #[error("url exceeds {MAX_URL_LEN} characters")]
    UrlTooLong,
    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("url '{0}' is malformed")]
    MalformedUrl(String),
    #[error("options.tags must be an object of string values")]
    InvalidTags,
    #[error("options.tags exceeds limit of {MAX_TAGS}")]
    TooManyTags,
    #[error("tag '{0}' exceeds {MAX_TAG_LEN} bytes")]
    TagTooLong(String),
    #[error("progress must be a finite number")]
    InvalidProgress,
    #[error("engine_handle must not be empty")]
    EmptyEngineHandle,
}

pub fn validate_task_request(request: &CreateTaskRequest) -> Result<(), TaskValidationError> {
    validate_url(request.url.trim())?;

    if let Some(tags) = request.options.get(TAGS_OPTION) {
        let tags = tags.as_object().ok_or(TaskValidationError::InvalidTags)?;
        if tags.len() > MAX_TAGS {
            return Err(TaskValidationError::TooManyTags);
        }
        for (key, value) in tags {
            let value = value.as_str().ok_or(TaskValidationError::InvalidTags)?;
            if key.len() > MAX_TAG_LEN || value.len() > MAX_TAG_LEN {
                return Err(TaskValidationError::TagTooLong(key.clone()));
            }
        }
    }

    Ok(())
}

pub fn validate_report(report: &TaskReport) -> Result<(), TaskValidationError> {
    if report.progress.is_some_and(|p| !p.is_finite()) {
        return Err(TaskValidationError::InvalidProgress);
    }
    if report.engine_handle.as_deref().is_some_and(|h| h.trim().is_empty()) {
        return Err(TaskValidationError::EmptyEngineHandle);
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<(), TaskValidationError> {
    if url.is_empty() {
        return Err(TaskValidationError::MissingUrl);
    }
    if url.len() > MAX_URL_LEN {
        return Err(TaskValidationError::UrlTooLong);
    }

    let (scheme, rest) = url
        .split_once(':')
        .ok_or_else(|| TaskValidationError::MalformedUrl(url.to_string()))?;
    let scheme = scheme.to_ascii_lowercase();
    if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
        return Err(TaskValidationError::UnsupportedScheme(scheme));
    }

    let well_formed = if scheme == "magnet" {
        rest.starts_with('?') && rest.len() > 1
    } else {
        rest.strip_prefix("//")
            .and_then(|r| r.split(['/', '?', '#']).next())
            .is_some_and(|host| !host.is_empty())
    };
    if !well_formed {
        return Err(TaskValidationError::MalformedUrl(url.to_string()));
    }

    Ok(())
}
