#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
mod pty;

pub use error::PtyError;
pub use error::SpawnErrorKind;
pub use pty::DEFAULT_READ_BUFFER_BYTES;
pub use pty::PtyHandle;
pub use pty::ReadEvent;
pub use pty::SpawnSpec;
pub use pty::SpawnedPty;
pub use pty::resolve_executable;

pub type Result<T> = std::result::Result<T, PtyError>;
