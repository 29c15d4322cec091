use std::fmt;

use mongodb::error::ErrorKind;
use thiserror::Error;

/// Server error codes the bootstrap branches on.
pub mod codes {
    pub const BAD_VALUE: i32 = 2;
    pub const FAILED_TO_PARSE: i32 = 9;
    pub const UNAUTHORIZED: i32 = 13;
    pub const AUTHENTICATION_FAILED: i32 = 18;
    pub const ALREADY_INITIALIZED: i32 = 23;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const NAMESPACE_EXISTS: i32 = 48;
    pub const CANNOT_CREATE_INDEX: i32 = 67;
    pub const INDEX_ALREADY_EXISTS: i32 = 68;
    pub const INVALID_OPTIONS: i32 = 72;
    pub const INDEX_OPTIONS_CONFLICT: i32 = 85;
    pub const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
}

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(Box<mongodb::error::Error>),
    #[error("Command failed ({code_name}, code {code}): {message}")]
    Command {
        code: i32,
        code_name: String,
        message: String,
    },
    #[error("Connectivity error: {0}")]
    Connectivity(String),
    #[error("Authorization error: {0}")]
    Authorization(String),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid client argument: {0}")]
    InvalidArgument(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Index build failed: {0}")]
    IndexBuild(String),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Operator-facing grouping of fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connectivity,
    Authorization,
    InvalidSpecification,
    Database,
    Configuration,
    Timeout,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connectivity => "connectivity",
            Self::Authorization => "authorization",
            Self::InvalidSpecification => "invalid_specification",
            Self::Database => "database",
            Self::Configuration => "configuration",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(label)
    }
}

impl AppError {
    /// Server error code, when the failure came back from a command.
    pub fn command_code(&self) -> Option<i32> {
        match self {
            Self::Command { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connectivity(_) => ErrorCategory::Connectivity,
            Self::Authorization(_) => ErrorCategory::Authorization,
            Self::Command { code, .. } => match *code {
                codes::BAD_VALUE
                | codes::FAILED_TO_PARSE
                | codes::CANNOT_CREATE_INDEX
                | codes::INVALID_OPTIONS
                | codes::INDEX_OPTIONS_CONFLICT
                | codes::INDEX_KEY_SPECS_CONFLICT => ErrorCategory::InvalidSpecification,
                _ => ErrorCategory::Database,
            },
            Self::Database(_) => ErrorCategory::Database,
            Self::Config(_) | Self::InvalidArgument(_) => ErrorCategory::Configuration,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::IndexBuild(_) => ErrorCategory::InvalidSpecification,
            Self::Anyhow(_) => ErrorCategory::Internal,
        }
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        match err.kind.as_ref() {
            ErrorKind::Command(command) => match command.code {
                codes::UNAUTHORIZED | codes::AUTHENTICATION_FAILED => {
                    Self::Authorization(format!("{} ({})", command.message, command.code_name))
                }
                _ => Self::Command {
                    code: command.code,
                    code_name: command.code_name.clone(),
                    message: command.message.clone(),
                },
            },
            ErrorKind::Authentication { message, .. } => Self::Authorization(message.clone()),
            // Raised client-side, e.g. for a malformed connection string.
            ErrorKind::InvalidArgument { message, .. } => Self::InvalidArgument(message.clone()),
            ErrorKind::ServerSelection { message, .. }
            | ErrorKind::DnsResolve { message, .. } => Self::Connectivity(message.clone()),
            ErrorKind::Io(io) => Self::Connectivity(io.to_string()),
            ErrorKind::ConnectionPoolCleared { message, .. } => {
                Self::Connectivity(message.clone())
            }
            _ => Self::Database(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::{
        bson::{doc, from_document},
        error::CommandError,
        options::ClientOptions,
    };

    fn driver_command_error(code: i32, code_name: &str, errmsg: &str) -> mongodb::error::Error {
        let command: CommandError = from_document(doc! {
            "code": code,
            "codeName": code_name,
            "errmsg": errmsg,
        })
        .expect("command error document");
        ErrorKind::Command(command).into()
    }

    fn command(code: i32, code_name: &str) -> AppError {
        AppError::Command {
            code,
            code_name: code_name.to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn command_code_only_for_command_errors() {
        assert_eq!(
            command(codes::NAMESPACE_EXISTS, "NamespaceExists").command_code(),
            Some(48)
        );
        assert_eq!(
            AppError::Connectivity("refused".into()).command_code(),
            None
        );
    }

    #[test]
    fn authorization_is_distinct_from_connectivity() {
        assert_eq!(
            AppError::Authorization("not authorized on agentic_os".into()).category(),
            ErrorCategory::Authorization
        );
        assert_eq!(
            AppError::Connectivity("server selection timeout".into()).category(),
            ErrorCategory::Connectivity
        );
    }

    #[test]
    fn driver_auth_codes_classify_as_authorization() {
        for (code, name) in [
            (codes::UNAUTHORIZED, "Unauthorized"),
            (codes::AUTHENTICATION_FAILED, "AuthenticationFailed"),
        ] {
            let err = AppError::from(driver_command_error(
                code,
                name,
                "not authorized on agentic_os to execute command",
            ));
            assert_eq!(err.category(), ErrorCategory::Authorization, "{name}");
            assert_eq!(err.command_code(), None);
        }
    }

    #[test]
    fn driver_already_exists_stays_a_command_error() {
        let err = AppError::from(driver_command_error(
            codes::NAMESPACE_EXISTS,
            "NamespaceExists",
            "Collection agentic_os.knowledge_base already exists.",
        ));

        assert_eq!(err.command_code(), Some(codes::NAMESPACE_EXISTS));
        assert_eq!(err.category(), ErrorCategory::Database);
        assert!(err.to_string().contains("NamespaceExists"));
    }

    #[test]
    fn driver_io_error_classifies_as_connectivity() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = AppError::from(mongodb::error::Error::from(io));

        assert!(matches!(err, AppError::Connectivity(_)));
        assert_eq!(err.category(), ErrorCategory::Connectivity);
    }

    #[tokio::test]
    async fn malformed_uri_classifies_as_configuration() {
        let driver_err = ClientOptions::parse("not-a-mongodb-uri")
            .await
            .expect_err("scheme is invalid");
        let err = AppError::from(driver_err);

        assert!(matches!(err, AppError::InvalidArgument(_)), "{err:?}");
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn malformed_index_codes_map_to_invalid_specification() {
        for (code, name) in [
            (codes::BAD_VALUE, "BadValue"),
            (codes::FAILED_TO_PARSE, "FailedToParse"),
            (codes::CANNOT_CREATE_INDEX, "CannotCreateIndex"),
            (codes::INDEX_OPTIONS_CONFLICT, "IndexOptionsConflict"),
        ] {
            assert_eq!(
                command(code, name).category(),
                ErrorCategory::InvalidSpecification,
                "{name}"
            );
        }
        assert_eq!(
            command(10107, "NotWritablePrimary").category(),
            ErrorCategory::Database
        );
    }

    #[test]
    fn category_labels_are_snake_case() {
        assert_eq!(
            ErrorCategory::InvalidSpecification.to_string(),
            "invalid_specification"
        );
        assert_eq!(ErrorCategory::Timeout.to_string(), "timeout");
    }
}
