use thiserror::Error;

#[derive(Error, Debug)]
pub enum MtakError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Integer parse error: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("Float parse error: {0}")]
    ParseFloatError(#[from] std::num::ParseFloatError),

    #[error("AUTO error: {message}")]
    AutoError { message: String },

    #[error("AMPCS error: {message}")]
    AmpcsError { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationError { message: String },

    #[error("Authorization failed: {message}")]
    AuthorizationError { message: String },

    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    #[error("Command service error: {message}")]
    CommandServiceError { message: String },

    #[error("Radiation error: {message}")]
    RadiationError { message: String },

    #[error("Command format error: {message}")]
    CommandFormatError { message: String },

    #[error("Wait error: {message}")]
    WaitError { message: String },

    #[error("Downlink error: {message}")]
    DownlinkError { message: String },

    #[error("Uplink error: {message}")]
    UplinkError { message: String },

    #[error("Invalid state: {message}")]
    InvalidStateError { message: String },

    #[error("Invalid initialization: {message}")]
    InvalidInitError { message: String },

    #[error("Environment error: {message}")]
    EnvironmentError { message: String },

    #[error("Not implemented: {message}")]
    NotImplemented { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for '{field}': '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required setting '{field}'")]
    MissingConfigError { field: String },

    #[error("Could not interpret time value '{value}': {reason}")]
    TimeFormatError { value: String, reason: String },

    #[error("Malformed telemetry message: {message}")]
    CsvFormatError { message: String },
}

pub type Result<T> = std::result::Result<T, MtakError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Security,
    Uplink,
    Downlink,
    Wait,
    Configuration,
    State,
    Io,
    Data,
}

impl MtakError {
    /// Map a `Success=N` return code reported by the uplink server.
    ///
    /// `output` carries the server lines that accompanied the failure and is
    /// folded into the message.
    pub fn from_return_code(code: u32, output: &str) -> Self {
        let message = if output.trim().is_empty() {
            format!("uplink server returned code {}", code)
        } else {
            format!("uplink server returned code {}: {}", code, output.trim())
        };

        match code {
            2 => MtakError::AuthenticationError { message },
            3 => MtakError::AuthorizationError { message },
            4 => MtakError::ConnectionError { message },
            5 => MtakError::CommandServiceError { message },
            6 => MtakError::RadiationError { message },
            7 => MtakError::AutoError { message },
            _ => MtakError::AmpcsError { message },
        }
    }

    /// Map a non-success HTTP status from the AUTO proxy or a REST service.
    pub fn from_http_status(status: u16, reason: &str) -> Self {
        let message = format!("HTTP {} {}", status, reason).trim_end().to_string();

        match status {
            400 | 405 | 415 | 422 => MtakError::AutoError { message },
            401 => MtakError::AuthenticationError { message },
            403 => MtakError::AuthorizationError { message },
            408 | 502 | 503 | 504 => MtakError::ConnectionError { message },
            409 | 500 => MtakError::CommandServiceError { message },
            _ => MtakError::AmpcsError { message },
        }
    }

    /// Errors raised by the AMPCS side. Callers re-raise these only when
    /// `throw_on_error` is set.
    pub fn is_automation_error(&self) -> bool {
        matches!(
            self,
            MtakError::AutoError { .. }
                | MtakError::AmpcsError { .. }
                | MtakError::AuthenticationError { .. }
                | MtakError::AuthorizationError { .. }
                | MtakError::ConnectionError { .. }
                | MtakError::CommandServiceError { .. }
                | MtakError::RadiationError { .. }
                | MtakError::HttpError(_)
        )
    }

    /// Errors that the script-facing API always logs and reports as `false`.
    pub fn is_swallowed(&self) -> bool {
        matches!(
            self,
            MtakError::CommandFormatError { .. }
                | MtakError::WaitError { .. }
                | MtakError::DownlinkError { .. }
                | MtakError::UplinkError { .. }
                | MtakError::InvalidStateError { .. }
                | MtakError::NotImplemented { .. }
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            MtakError::HttpError(_) | MtakError::ConnectionError { .. } => ErrorCategory::Network,
            MtakError::AuthenticationError { .. } | MtakError::AuthorizationError { .. } => {
                ErrorCategory::Security
            }
            MtakError::AutoError { .. }
            | MtakError::AmpcsError { .. }
            | MtakError::CommandServiceError { .. }
            | MtakError::RadiationError { .. }
            | MtakError::CommandFormatError { .. }
            | MtakError::UplinkError { .. } => ErrorCategory::Uplink,
            MtakError::DownlinkError { .. } => ErrorCategory::Downlink,
            MtakError::WaitError { .. } => ErrorCategory::Wait,
            MtakError::ConfigError { .. }
            | MtakError::InvalidConfigValueError { .. }
            | MtakError::MissingConfigError { .. }
            | MtakError::EnvironmentError { .. }
            | MtakError::InvalidInitError { .. } => ErrorCategory::Configuration,
            MtakError::InvalidStateError { .. } | MtakError::NotImplemented { .. } => {
                ErrorCategory::State
            }
            MtakError::IoError(_) => ErrorCategory::Io,
            MtakError::SerializationError(_)
            | MtakError::ParseIntError(_)
            | MtakError::ParseFloatError(_)
            | MtakError::TimeFormatError { .. }
            | MtakError::CsvFormatError { .. } => ErrorCategory::Data,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Wait | ErrorCategory::Data => ErrorSeverity::Low,
            ErrorCategory::Network | ErrorCategory::Downlink => ErrorSeverity::Medium,
            ErrorCategory::Uplink | ErrorCategory::State | ErrorCategory::Configuration => {
                ErrorSeverity::High
            }
            ErrorCategory::Security | ErrorCategory::Io => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Network => "Check that the AMPCS services are running and reachable",
            ErrorCategory::Security => "Check the login method, keytab file and user role",
            ErrorCategory::Uplink => "Inspect the uplink server log for the rejected request",
            ErrorCategory::Downlink => "Check the session key and the downlink server output",
            ErrorCategory::Wait => "Relax the wait condition or increase the timeout",
            ErrorCategory::Configuration => "Review the configuration file and CHILL_GDS",
            ErrorCategory::State => "Call startup before using the automation API",
            ErrorCategory::Io => "Check file paths and permissions",
            ErrorCategory::Data => "Check the format of the supplied value",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            MtakError::MissingConfigError { field } => {
                format!("The setting '{}' is required but was not provided", field)
            }
            MtakError::InvalidConfigValueError { field, reason, .. } => {
                format!("The setting '{}' is invalid: {}", field, reason)
            }
            MtakError::HttpError(e) if e.is_connect() => {
                "Could not connect to the AMPCS proxy".to_string()
            }
            other => other.to_string(),
        }
    }
}
