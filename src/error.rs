use thiserror::Error;

/// Errors raised while decoding a status record received over one of the
/// hardware protocols.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected 6 fields in status line, got {0}")]
    FieldCount(usize),

    #[error("status line field {index} is not an integer: {value:?}")]
    InvalidField { index: usize, value: String },

    #[error("type bits {0:03b} do not name a catalog type")]
    InvalidTypeBits(u8),

    #[error("reserved bits set in packed status byte {0:08b}")]
    ReservedBits(u8),
}

/// Errors raised while deriving or persisting the pixel scale.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("reference rectangle has a degenerate edge ({0:.2} px)")]
    DegenerateReference(f64),

    #[error("computed scale {0:.2} px/cm is not positive")]
    NonPositiveScale(f64),

    #[error("reference size must be positive, got {0} cm")]
    InvalidReferenceSize(f64),

    #[error("calibration store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a frame source.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("frame source is not open")]
    NotOpen,

    #[error("failed to capture frame: {0}")]
    Capture(String),

    #[error("failed to decode frame {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}
