//! File operations.

pub mod upload;

pub use upload::{backup_path, upload, TransferTarget, UploadError};
