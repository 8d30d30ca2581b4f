use snafu::Snafu;
use std::io;

pub type Result<T, E = PdfError> = std::result::Result<T, E>;

/// The CORE's single error type. One variant per taxonomy entry described in
/// the toolkit's error handling design.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PdfError {
    #[snafu(display("corrupt source: {detail} (at offset {offset:?})"))]
    CorruptSource { detail: String, offset: Option<usize> },

    #[snafu(display("corrupt reference: object {obj_nr} gen {gen}: {detail}"))]
    CorruptRef { obj_nr: u32, gen: u16, detail: String },

    #[snafu(display("corrupt page tree: {detail}"))]
    CorruptPageTree { detail: String },

    #[snafu(display("corrupt name tree: {detail}"))]
    CorruptNameTree { detail: String },

    #[snafu(display("unsupported filter {name}: {detail}"))]
    UnsupportedFilter { name: String, detail: String },

    #[snafu(display("feature {feature} requires PDF version >= {since}, document declares {declared}"))]
    UnsupportedVersion { feature: String, since: f32, declared: f32 },

    #[snafu(display("document is encrypted and no credentials were supplied"))]
    EncryptionNotSupported,

    #[snafu(display("operation cancelled"))]
    Cancelled,

    #[snafu(display("io error: {source}"))]
    Io { source: io::Error },

    #[snafu(display("utf8 error: {source}"))]
    Utf8 { source: std::str::Utf8Error },
}

impl From<io::Error> for PdfError {
    fn from(source: io::Error) -> Self {
        PdfError::Io { source }
    }
}

impl PdfError {
    pub fn corrupt(detail: impl Into<String>) -> Self {
        PdfError::CorruptSource { detail: detail.into(), offset: None }
    }
    pub fn corrupt_at(detail: impl Into<String>, offset: usize) -> Self {
        PdfError::CorruptSource { detail: detail.into(), offset: Some(offset) }
    }
}

/// Build a `CorruptSource` from a format string and return early.
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::error::PdfError::corrupt(format!($($arg)*)))
    };
}
pub(crate) use bail;
