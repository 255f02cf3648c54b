#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Not found: {0}")]
    EntityNotFound(String),

    #[error("Permission denied")]
    Forbidden,

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Corrupt cache entry: {0}")]
    CacheCorrupt(String),

    /// The backend does not provide the requested procedure
    #[error("Unavailable on this backend: {0}")]
    Unavailable(String),

    #[error("Invalid comment: {0}")]
    InvalidContent(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),
}

impl Error {
    /// Only network failures are worth retrying, everything else will fail the same way again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientNetwork(_))
    }

    /// Classifies a non-successful backend response.
    ///
    /// `rpc` is set for calls to stored procedures, for which a 404 means the
    /// procedure itself does not exist. The database error code of the body
    /// takes precedence over the status when it is a known one.
    pub fn from_status(status: http::StatusCode, rpc: bool, body: &[u8]) -> Error {
        use http::StatusCode;
        let decoded = serde_json::from_slice::<BackendErrorBody>(body).ok();
        let msg = match &decoded {
            Some(b) => b.describe(),
            None => String::from_utf8_lossy(body).into_owned(),
        };
        match decoded.as_ref().and_then(|b| b.code.as_deref()) {
            // could not find the function
            Some("PGRST202") => return Error::Unavailable(msg),
            // singular response requested but no row matched
            Some("PGRST116") => return Error::EntityNotFound(msg),
            // foreign key violation: the entity or parent comment is gone
            Some("23503") => return Error::EntityNotFound(msg),
            Some("42501") => return Error::Forbidden,
            // check constraint, string too long
            Some("23514") | Some("22001") => return Error::InvalidContent(msg),
            _ => (),
        }
        match status {
            StatusCode::UNAUTHORIZED => Error::NotAuthenticated,
            StatusCode::FORBIDDEN => Error::Forbidden,
            StatusCode::NOT_FOUND if rpc => Error::Unavailable(msg),
            StatusCode::NOT_FOUND => Error::EntityNotFound(msg),
            StatusCode::NOT_IMPLEMENTED => Error::Unavailable(msg),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Error::TransientNetwork(format!("{status}"))
            }
            s if s.is_server_error() => Error::TransientNetwork(format!("{status}: {msg}")),
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                Error::InvalidContent(msg)
            }
            _ => Error::Unknown(format!("unexpected response status {status}: {msg}")),
        }
    }
}

/// Error body of PostgREST responses
#[derive(Debug, serde::Deserialize)]
struct BackendErrorBody {
    message: Option<String>,
    code: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

impl BackendErrorBody {
    fn describe(&self) -> String {
        let mut res = self.message.clone().unwrap_or_default();
        for extra in [&self.details, &self.hint].into_iter().flatten() {
            if !res.is_empty() {
                res.push_str(": ");
            }
            res.push_str(extra);
        }
        if let Some(code) = &self.code {
            res.push_str(&format!(" ({code})"));
        }
        res
    }
}
