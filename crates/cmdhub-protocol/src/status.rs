use std::fmt;

/// Numeric outcome sent as the first field of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(i32);

impl StatusCode {
    /// Command succeeded.
    pub const OK: Self = Self(0);
    /// Wrong arguments.
    pub const EARGS: Self = Self(-51);
    /// Invalid email address.
    pub const INVALID_EMAIL: Self = Self(-52);
    /// Resource not found.
    pub const NOT_FOUND: Self = Self(-53);
    /// Invalid state.
    pub const INVALID_STATE: Self = Self(-54);
    /// Invalid type.
    pub const INVALID_TYPE: Self = Self(-55);
    /// Operation not allowed.
    pub const NOT_PERMITTED: Self = Self(-56);
    /// No session is open.
    pub const NOT_LOGGED_IN: Self = Self(-57);
    /// Remote nodes have not been fetched.
    pub const NO_FETCH: Self = Self(-58);
    /// Unexpected failure.
    pub const UNEXPECTED: Self = Self(-59);
    /// The daemon asks the client for confirmation before finishing.
    pub const REQUEST_CONFIRMATION: Self = Self(-60);

    /// Wraps a raw status value.
    #[must_use]
    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    /// Raw status value as sent on the wire.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Returns `true` for [`StatusCode::OK`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Maps the status into a process exit code.
    ///
    /// Negative codes exit with their magnitude; values beyond 255 saturate.
    #[must_use]
    pub fn exit_code(self) -> u8 {
        u8::try_from(self.0.unsigned_abs()).unwrap_or(u8::MAX)
    }
}

impl From<i32> for StatusCode {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::OK => "OK",
            Self::EARGS => "EARGS",
            Self::INVALID_EMAIL => "INVALIDEMAIL",
            Self::NOT_FOUND => "NOTFOUND",
            Self::INVALID_STATE => "INVALIDSTATE",
            Self::INVALID_TYPE => "INVALIDTYPE",
            Self::NOT_PERMITTED => "NOTPERMITTED",
            Self::NOT_LOGGED_IN => "NOTLOGGEDIN",
            Self::NO_FETCH => "NOFETCH",
            Self::UNEXPECTED => "EUNEXPECTED",
            Self::REQUEST_CONFIRMATION => "REQCONFIRM",
            Self(code) => return write!(formatter, "{code}"),
        };
        formatter.write_str(name)
    }
}
