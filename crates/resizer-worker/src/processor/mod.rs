//! `resize-image` task processor and the I/O it depends on.

pub mod resize;
pub mod source;
pub mod storage;

pub use self::resize::ResizeProcessor;
pub use self::source::HttpImageSource;
pub use self::storage::{S3Config, S3Storage};
