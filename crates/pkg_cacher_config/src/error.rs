use thiserror::Error;

/// A configuration value was present but could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An ACL entry (`allowed_hosts`, `denied_hosts`, ...) was not a
    /// recognised address, CIDR, or range.
    #[error("invalid ACL entry in {0}: {1}")]
    InvalidAcl(&'static str, String),

    /// A `path_map` directive was malformed.
    #[error("invalid path_map entry: {0}")]
    InvalidPathMap(String),

    /// A boolean-valued key held something other than 0/1/true/false/yes/no.
    #[error("invalid boolean for {0}: {1}")]
    InvalidBool(&'static str, String),

    /// An integer-valued key held something that didn't parse.
    #[error("invalid integer for {0}: {1}")]
    InvalidInt(&'static str, String),

    /// A URL-valued key held something that didn't parse as a URL.
    #[error("invalid URL for {0}: {1}")]
    InvalidUrl(&'static str, String),

    /// `limit` held something other than `<N>`, `<N>k`, or `<N>m`.
    #[error("invalid bandwidth limit: {0}")]
    InvalidLimit(String),

    /// A required structural key (e.g. `cache_dir`) was missing.
    #[error("missing required configuration key: {0}")]
    MissingRequiredField(&'static str),

    /// An address-valued key (`daemon_addr`) held something unparseable.
    #[error("invalid address for {0}: {1}")]
    InvalidAddr(&'static str, String),
}

/// Raised while reading or parsing a configuration file.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The configuration file could not be read from disk.
    #[error("could not read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// A directive line was malformed (no key, or a key with no value).
    #[error("malformed directive on line {line}: {text:?}")]
    MalformedDirective {
        /// 1-based line number.
        line: usize,
        /// The offending line, verbatim.
        text: String,
    },

    /// The parsed directives did not form a valid configuration.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
