use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwitchCryptError {
    #[error("Backing file already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Backing file does not exist: {0}")]
    FileDoesNotExist(String),

    #[error("Backstore is not initialized")]
    BackstoreNotInitialized,

    #[error("Bad password: verification tag mismatch")]
    BadPassword,

    #[error("Integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("Unknown or unimplemented cipher: {0}")]
    StringToCipherFailed(String),

    #[error("Unknown swap strategy: {0}")]
    UnknownSwapStrategy(String),

    #[error("Invalid selective range: {0}")]
    InvalidSelectiveRange(String),

    #[error("Invalid backstore size: {0}")]
    InvalidBackstoreSize(String),

    #[error("Invalid flakes per nugget: {0}")]
    InvalidFlakesPerNugget(String),

    #[error("Too many flakes per nugget: {0} (max {})", crate::config::MAX_FLAKES_PER_NUGGET)]
    TooManyFlakesPerNugget(u64),

    #[error("Invalid flake size: {0}")]
    InvalidFlakeSize(String),

    #[error("Invalid TPM/counter slot id: {0}")]
    InvalidTpmId(String),

    #[error("Monotonic counter device unavailable: {0}")]
    CounterDeviceUnavailable(String),

    #[error("Unknown mode: {0} (expected create, open or wipe)")]
    UnknownMode(String),

    #[error("Must halt: {0}")]
    MustHalt(String),

    #[error("Out of bounds: offset {offset} + len {len} exceeds size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Corrupt geometry: {0}")]
    CorruptGeometry(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwitchCryptError>;
