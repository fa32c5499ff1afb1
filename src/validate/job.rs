//! Unit of work flowing through the validation pipeline.

use crate::resource::ValidatedResourceResponse;

/// One YAML document on its way through the pipeline. The document travels
/// as the raw text it was split from, so the backend receives the author's
/// bytes untouched. A job either carries that document or a terminal error
/// recorded at an earlier stage; later stages pass errored jobs straight
/// through.
#[derive(Debug, Clone)]
pub struct Job {
    pub resource_data: String,
    pub file_path: String,
    pub result: Option<ValidatedResourceResponse>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(resource_data: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            resource_data: resource_data.into(),
            file_path: file_path.into(),
            result: None,
            error: None,
        }
    }

    pub fn with_error(file_path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            resource_data: String::new(),
            file_path: file_path.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}
