use std::error::Error;
use std::fmt::{Display, Formatter};

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// One input to an accumulation was unreadable or had the wrong shape.
    Contribution,
    /// A group cannot be completed; siblings continue.
    Group,
    /// The run as a whole is misconfigured; nothing is processed.
    Configuration,
    /// A canonical output exists where a fresh run was required.
    OutputCollision,
    ExternalOperation,
    IoSystem,
    Internal,
}

impl ErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Contribution => "ContributionError",
            Self::Group => "GroupError",
            Self::Configuration => "ConfigurationError",
            Self::OutputCollision => "OutputCollisionError",
            Self::ExternalOperation => "ExternalOperationError",
            Self::IoSystem => "IoSystemError",
            Self::Internal => "InternalError",
        }
    }

    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Configuration => 2,
            Self::OutputCollision => 3,
            Self::IoSystem => 4,
            Self::ExternalOperation | Self::Group | Self::Contribution => 5,
            Self::Internal => 6,
        }
    }

    /// Whether an error of this category aborts the whole run rather than a
    /// single group or contribution. Failed writes are system failures and
    /// stop the run even when raised inside a group.
    pub const fn aborts_run(self) -> bool {
        matches!(
            self,
            Self::Configuration | Self::OutputCollision | Self::IoSystem | Self::Internal
        )
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineError {
    category: ErrorCategory,
    code: &'static str,
    message: String,
}

impl PipelineError {
    pub fn new(category: ErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
        }
    }

    pub fn contribution(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Contribution, code, message)
    }

    pub fn group(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Group, code, message)
    }

    pub fn configuration(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, code, message)
    }

    pub fn output_collision(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::OutputCollision, code, message)
    }

    pub fn external(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ExternalOperation, code, message)
    }

    pub fn io_system(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::IoSystem, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    pub const fn category(&self) -> ErrorCategory {
        self.category
    }

    pub const fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        format!("ERROR: [{}] {}", self.code, self.message)
    }

    pub fn fatal_exit_line(&self) -> String {
        format!("FATAL EXIT CODE: {}", self.exit_code())
    }
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.category, self.code, self.message)
    }
}

impl Error for PipelineError {}
