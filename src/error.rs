//! Error handling. All errors are routed through [`Error`], and the crate-wide
//! [`Result`] alias defaults to it.

/// A caskdb error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The stored data is corrupted: a record failed its checksum, declared
    /// sizes inconsistent with the bytes on disk, and so on.
    Corrupt(String),
    /// An invalid user request, e.g. a malformed REPL command or an unknown
    /// segment id.
    InvalidInput(String),
    /// An I/O error from the filesystem.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corrupt(msg) | Error::InvalidInput(msg) | Error::IO(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

/// Constructs an Error::Corrupt via format!() and returns it.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { return Err($crate::error::Error::Corrupt(format!($($args)*))) };
}

/// Constructs an Error::InvalidInput via format!() and returns it.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { return Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

/// A caskdb result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<rustyline::error::ReadlineError> for Error {
    fn from(err: rustyline::error::ReadlineError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(err: std::time::SystemTimeError) -> Self {
        Error::IO(err.to_string())
    }
}
