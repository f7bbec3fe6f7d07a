//! Runs the `nio` command-line program, compiled to WebAssembly, against an
//! in-memory filesystem.
//!
//! A [`ProgramImage`] is fetched and compiled once per process through
//! [`ImageCache`]. Each [`Session`] owns a [`Vfs`] whose reserved streams act
//! as the program's stdin, stdout and stderr; every [`Session::exec`] runs a
//! fresh instance against it.

mod bridge;
mod config;
mod image;
mod report;
mod session;
mod wasi;

pub use bridge::{run, ExecError, ExecRequest, ExecResult, RunnerConfig};
pub use config::{ImageConfig, RunnerLimits};
pub use image::{sha256_hex, FetchImage, ImageCache, ImageSource, LoadError, ProgramImage};
pub use nio_vfs::{StdStream, Vfs, VfsError};
pub use report::run_report;
pub use session::{ExecOutput, Session, SessionOptions, StdinPolicy};
pub use wasi::IoStats;
