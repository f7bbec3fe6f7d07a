//! Shared, version-pinned identifiers.
//!
//! These constants are the single source of truth for names and schema/version
//! strings that appear in machine-readable I/O or in the contract with the
//! sandboxed `nio` program.

pub const NIO_HOST_RUNNER_REPORT_SCHEMA_VERSION: &str = "nio-host-runner.report@0.1.0";

/// argv[0] of every instance.
pub const PROGRAM_NAME: &str = "nio";

/// Build artifact location used when no image is configured.
pub const DEFAULT_IMAGE_LOCATION: &str = "target/wasm32-wasi/release/nio.wasm";

/// Export invoked to run an instance.
pub const ENTRY_POINT_EXPORT: &str = "_start";
pub const MEMORY_EXPORT: &str = "memory";

pub const WASI_PREVIEW1_MODULE: &str = "wasi_snapshot_preview1";

pub const ENV_IMAGE: &str = "NIO_IMAGE";
pub const ENV_IMAGE_SHA256: &str = "NIO_IMAGE_SHA256";
pub const ENV_FUEL: &str = "NIO_FUEL";
pub const ENV_MAX_MEMORY_BYTES: &str = "NIO_MAX_MEMORY_BYTES";
pub const ENV_MAX_OUTPUT_BYTES: &str = "NIO_MAX_OUTPUT_BYTES";
pub const ENV_LOG: &str = "NIO_LOG";
