use thiserror::Error;

/// Domain error kinds for the acquisition, calibration, codec and server layers.
#[derive(Error, Debug)]
pub enum PmuError {
    #[error("source read failed: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("failed to open sample source: {0}")]
    SourceOpen(#[source] std::io::Error),

    #[error("client I/O error: {0}")]
    ClientIo(#[source] std::io::Error),

    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("settings file I/O error: {0}")]
    ConfigIo(#[source] std::io::Error),

    #[error("calibration degenerate for signal {signal}: {reason}")]
    CalibrationDegenerate { signal: usize, reason: String },

    #[error("estimator precondition violated: fs={fs}, f0={f0}")]
    EstimatorPrecondition { fs: u32, f0: u32 },

    #[error("signal index {0} out of range (expected 0..6)")]
    InvalidSignalIndex(usize),

    #[error("calibration point has negative component: ({0}, {1})")]
    InvalidPoint(f64, f64),
}

pub type Result<T> = std::result::Result<T, PmuError>;
