use thiserror::Error;

/// Errores transitorios del decodificador de notificaciones PPG
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Notification too short: {len} bytes")]
    TooShort { len: usize },

    #[error("Unknown chapter {0}")]
    UnknownChapter(u8),

    #[error("Duplicate sequence index {0}")]
    DuplicateSequence(u8),
}

/// Errores de una línea del protocolo serie del IMU
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("Invalid field {index}: {value:?}")]
    BadField { index: usize, value: String },
}

/// Errores de la cadena de filtros
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Invalid class count: expected {expected}, got {actual}")]
    ClassCountMismatch { expected: usize, actual: usize },

    #[error("Probability vector has no mass")]
    ZeroMass,

    #[error("State {0} out of range")]
    InvalidState(usize),

    #[error("Invalid matrix: {0}")]
    InvalidMatrix(String),
}

/// Errores en la frontera con el clasificador externo
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Not enough samples: need {needed}, have {available}")]
    NotEnoughSamples { needed: usize, available: usize },

    #[error("Replay exhausted")]
    Exhausted,

    #[error("Classifier failed: {0}")]
    Other(String),
}

/// Fallos a nivel de sesión (terminales)
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Link closed")]
    LinkClosed,

    #[error("Link error: {0}")]
    Link(#[from] std::io::Error),

    #[error("Context {0} panicked")]
    Thread(&'static str),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
}
