use thiserror::Error;

pub type Result<T> = std::result::Result<T, TapeBridgeError>;

#[derive(Error, Debug)]
pub enum TapeBridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transition table conflict: {0}")]
    Conflict(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("allocation rejected: {0}")]
    Rejected(String),

    #[error("collaborator timeout: {0}")]
    Timeout(String),

    #[error("checksum mismatch on block {sequence}: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    Checksum {
        sequence: u64,
        stored: u32,
        computed: u32,
    },

    #[error("block sequence error: expected {expected}, got {got}")]
    Sequence { expected: u64, got: u64 },

    #[error("tape drive error: {0}")]
    Drive(String),

    #[error("peer connection error: {0}")]
    Peer(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl TapeBridgeError {
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn illegal_transition<T: Into<String>>(msg: T) -> Self {
        Self::IllegalTransition(msg.into())
    }

    pub fn rejected<T: Into<String>>(msg: T) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn drive<T: Into<String>>(msg: T) -> Self {
        Self::Drive(msg.into())
    }

    pub fn peer<T: Into<String>>(msg: T) -> Self {
        Self::Peer(msg.into())
    }

    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }
}
