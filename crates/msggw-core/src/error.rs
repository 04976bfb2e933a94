use thiserror::Error;

/// Errors produced by the gateway connection layer.
///
/// Every variant carries an API error code (see [`GatewayError::code`]) that
/// ends up in the JSON response envelope, and an HTTP status used when the
/// failure is reported before a WebSocket upgrade.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("args error: {0}")]
    Args(String),

    #[error("conn args error: {0}")]
    ConnArgs(String),

    #[error("over max conn num limit")]
    ConnOverMaxNumLimit,

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid: {0}")]
    TokenInvalid(String),

    #[error("token malformed: {0}")]
    TokenMalformed(String),

    #[error("token unknown: {0}")]
    TokenUnknown(String),

    #[error("token kicked")]
    TokenKicked,

    #[error("token does not exist")]
    TokenNotExist,

    #[error("connection is nil")]
    ConnNil,

    #[error("connection closed")]
    ConnClosed,

    #[error("read limit exceeded: {size} bytes (limit {limit})")]
    ReadLimitExceeded { size: usize, limit: i64 },

    #[error("timeout")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub const ARGS_ERROR: i32 = 1001;
pub const TOKEN_EXPIRED_ERROR: i32 = 1501;
pub const TOKEN_INVALID_ERROR: i32 = 1502;
pub const TOKEN_MALFORMED_ERROR: i32 = 1503;
pub const TOKEN_UNKNOWN_ERROR: i32 = 1505;
pub const TOKEN_KICKED_ERROR: i32 = 1506;
pub const TOKEN_NOT_EXIST_ERROR: i32 = 1507;
pub const CONN_OVER_MAX_NUM_LIMIT: i32 = 1601;
pub const CONN_ARGS_ERROR: i32 = 1602;
pub const SERVER_INTERNAL_ERROR: i32 = 500;

impl GatewayError {
    /// API error code reported to clients.
    pub fn code(&self) -> i32 {
        match self {
            GatewayError::Args(_) => ARGS_ERROR,
            GatewayError::ConnArgs(_) => CONN_ARGS_ERROR,
            GatewayError::ConnOverMaxNumLimit => CONN_OVER_MAX_NUM_LIMIT,
            GatewayError::TokenExpired => TOKEN_EXPIRED_ERROR,
            GatewayError::TokenInvalid(_) => TOKEN_INVALID_ERROR,
            GatewayError::TokenMalformed(_) => TOKEN_MALFORMED_ERROR,
            GatewayError::TokenUnknown(_) => TOKEN_UNKNOWN_ERROR,
            GatewayError::TokenKicked => TOKEN_KICKED_ERROR,
            GatewayError::TokenNotExist => TOKEN_NOT_EXIST_ERROR,
            _ => SERVER_INTERNAL_ERROR,
        }
    }

    /// HTTP status used when the error is written before an upgrade.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Args(_)
            | GatewayError::ConnArgs(_)
            | GatewayError::ConnOverMaxNumLimit => 400,
            e if e.is_token_error() => 401,
            _ => 500,
        }
    }

    /// Whether the error came out of token verification or the status lookup.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            GatewayError::TokenExpired
                | GatewayError::TokenInvalid(_)
                | GatewayError::TokenMalformed(_)
                | GatewayError::TokenUnknown(_)
                | GatewayError::TokenKicked
                | GatewayError::TokenNotExist
        )
    }

    /// Short message without the variant prefix, used as `errMsg`.
    pub fn message(&self) -> &'static str {
        match self {
            GatewayError::Args(_) => "ArgsError",
            GatewayError::ConnArgs(_) => "ConnArgsError",
            GatewayError::ConnOverMaxNumLimit => "ConnOverMaxNumLimit",
            GatewayError::TokenExpired => "TokenExpiredError",
            GatewayError::TokenInvalid(_) => "TokenInvalidError",
            GatewayError::TokenMalformed(_) => "TokenMalformedError",
            GatewayError::TokenUnknown(_) => "TokenUnknownError",
            GatewayError::TokenKicked => "TokenKickedError",
            GatewayError::TokenNotExist => "TokenNotExistError",
            _ => "ServerInternalError",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
