//! Error kinds for the object lifecycle core, each mapped to one HTTP status.
//! No `thiserror`/`anyhow`: a plain enum with hand-written `Display`, matching
//! the rest of this stack.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    BadRequest {
        message: String,
        source: Option<Box<Error>>,
    },
    Unauthorized {
        message: String,
    },
    Forbidden {
        message: String,
    },
    NotFound {
        message: String,
    },
    NotAcceptable {
        message: String,
    },
    Conflict {
        message: String,
    },
    PreconditionFailed {
        message: String,
    },
    UnsupportedMediaType {
        message: String,
    },
    Internal {
        message: String,
        source: Option<Box<Error>>,
    },
}

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest {
            message: message.into(),
            source: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::Unauthorized {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Error::Forbidden {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Error::NotAcceptable {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
        }
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Error::PreconditionFailed {
            message: message.into(),
        }
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Error::UnsupportedMediaType {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `self` with additional context, preserving the original kind —
    /// the cause chain grows but a `bad-request` never becomes an `internal`.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            Error::BadRequest { message, source } => Error::BadRequest {
                message: context,
                source: Some(Box::new(Error::BadRequest { message, source })),
            },
            Error::Internal { message, source } => Error::Internal {
                message: context,
                source: Some(Box::new(Error::Internal { message, source })),
            },
            other => other,
        }
    }

    /// HTTP status this error kind maps to.
    pub fn status(&self) -> u16 {
        match self {
            Error::BadRequest { .. } => 400,
            Error::Unauthorized { .. } => 401,
            Error::Forbidden { .. } => 403,
            Error::NotFound { .. } => 404,
            Error::NotAcceptable { .. } => 406,
            Error::Conflict { .. } => 409,
            Error::PreconditionFailed { .. } => 412,
            Error::UnsupportedMediaType { .. } => 415,
            Error::Internal { .. } => 500,
        }
    }

    /// Flattened messages for the wire format in `{ "messages": [...], "code": N }`,
    /// outermost first.
    pub fn messages(&self) -> Vec<String> {
        let mut out = vec![self.to_string()];
        let mut cur: Option<&Error> = match self {
            Error::BadRequest { source, .. } => source.as_deref(),
            Error::Internal { source, .. } => source.as_deref(),
            _ => None,
        };
        while let Some(e) = cur {
            out.push(e.to_string());
            cur = match e {
                Error::BadRequest { source, .. } => source.as_deref(),
                Error::Internal { source, .. } => source.as_deref(),
                _ => None,
            };
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadRequest { message, .. } => write!(f, "{message}"),
            Error::Unauthorized { message } => write!(f, "{message}"),
            Error::Forbidden { message } => write!(f, "{message}"),
            Error::NotFound { message } => write!(f, "{message}"),
            Error::NotAcceptable { message } => write!(f, "{message}"),
            Error::Conflict { message } => write!(f, "{message}"),
            Error::PreconditionFailed { message } => write!(f, "{message}"),
            Error::UnsupportedMediaType { message } => write!(f, "{message}"),
            Error::Internal { message, .. } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::BadRequest { source, .. } => source.as_deref().map(|e| e as _),
            Error::Internal { source, .. } => source.as_deref().map(|e| e as _),
            _ => None,
        }
    }
}

impl From<reflecta_store::StoreError> for Error {
    fn from(value: reflecta_store::StoreError) -> Self {
        Error::internal(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec() {
        assert_eq!(Error::bad_request("x").status(), 400);
        assert_eq!(Error::unauthorized("x").status(), 401);
        assert_eq!(Error::forbidden("x").status(), 403);
        assert_eq!(Error::not_found("x").status(), 404);
        assert_eq!(Error::not_acceptable("x").status(), 406);
        assert_eq!(Error::conflict("x").status(), 409);
        assert_eq!(Error::precondition_failed("x").status(), 412);
        assert_eq!(Error::unsupported_media_type("x").status(), 415);
        assert_eq!(Error::internal("x").status(), 500);
    }

    #[test]
    fn context_preserves_kind_and_grows_chain() {
        let e = Error::internal("store write failed").with_context("create failed");
        assert_eq!(e.status(), 500);
        assert_eq!(e.messages(), vec!["create failed", "store write failed"]);
    }
}
