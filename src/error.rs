use thiserror::Error;

pub type HwLBResult<T> = Result<T, HwLBError>;

#[derive(Debug, Error)]
pub enum HwLBError {
    #[error("Invalid value {value:?} of annotation {key}: {reason}")]
    InvalidAnnotation {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Unsupported load balancer class: {0:?}")]
    UnsupportedClass(String),
    #[error("Service was skipped")]
    SkipService,
    #[error("Credential secret {0} is not cached")]
    MissingCredential(String),
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("Load balancer {0} does not exist")]
    LoadBalancerNotFound(String),
    #[error("Cloud API error: {0}")]
    CloudError(String),
    #[error("Cannot read configuration: {0}")]
    ConfigError(String),
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Kube error: {0}")]
    KubeError(#[from] kube::Error),
}

impl HwLBError {
    pub fn invalid_annotation(
        key: &'static str,
        value: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::InvalidAnnotation {
            key,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Secret field {field} is not valid base64: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("Secret field {field} is not valid UTF-8 after decoding")]
    NotUtf8 { field: &'static str },
    /// Decoding an already decoded record is a logic bug in the caller.
    #[error("Secret can not be decoded twice")]
    AlreadyDecoded,
}

/// Returns true if the error is an API error with the given HTTP code.
#[must_use]
pub fn is_api_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    is_api_code(err, 404)
}

#[must_use]
pub fn is_conflict(err: &kube::Error) -> bool {
    is_api_code(err, 409)
}

#[cfg(test)]
pub fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("request failed with {code}"),
        reason: match code {
            404 => "NotFound",
            409 => "Conflict",
            _ => "InternalError",
        }
        .to_string(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_api_errors() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_conflict(&api_error(404)));
        assert!(is_conflict(&api_error(409)));
        assert!(!is_not_found(&api_error(500)));
    }

    #[test]
    fn annotation_error_names_key_and_value() {
        let err = HwLBError::invalid_annotation("kubernetes.io/elb.class", "bogus", "unknown");
        let message = err.to_string();
        assert!(message.contains("kubernetes.io/elb.class"));
        assert!(message.contains("bogus"));
    }
}
