use std::path::PathBuf;

use thiserror::Error;

use crate::tag::Tag;

#[derive(Debug, Error)]
pub enum IndexError {
    /// The persisted index could not be parsed. Callers rebuild from disk.
    #[error("Malformed index document: {0}")]
    Parse(String),

    /// An affine could not be built because a geometry tag is absent or invalid.
    #[error("Missing or invalid geometry tag {0:?}")]
    GeometryMissing(Tag),

    #[error("Image geometry is not invertible")]
    SingularGeometry,

    #[error(
        "Index and file disagree on {tag:?} for {}: index has {indexed:?}, file has {on_disk:?}",
        .path.display()
    )]
    ConsistencyViolation {
        path: PathBuf,
        tag: Tag,
        indexed: String,
        on_disk: Option<String>,
    },

    #[error("A non-empty suffix is required to resolve the name collision on {0:?}")]
    EmptySuffix(String),

    #[error("Entity has no files on disk yet")]
    Unbound,

    #[error("Entity has been deleted")]
    Deleted,

    #[error("Not present in the index: {0}")]
    NotFound(String),

    #[error("File store error on {}: {message}", .path.display())]
    Store { path: PathBuf, message: String },

    #[error("Pixel data error: {0}")]
    PixelData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM read error: {0}")]
    DicomRead(#[from] dicom::object::ReadError),

    #[error("DICOM write error: {0}")]
    DicomWrite(#[from] dicom::object::WriteError),
}

pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    pub(crate) fn parse(message: impl std::fmt::Display) -> Self {
        IndexError::Parse(message.to_string())
    }

    pub(crate) fn store(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        IndexError::Store {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
