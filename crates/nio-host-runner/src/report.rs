use base64::Engine as _;
use nio_contracts::NIO_HOST_RUNNER_REPORT_SCHEMA_VERSION;
use serde_json::Value;

use crate::bridge::{ExecError, ExecRequest, ExecResult};
use crate::image::ProgramImage;

/// Machine-readable summary of one `run`. `stdout`/`stderr` are what the
/// run wrote, including output produced before a fault.
pub fn run_report(
    image: &ProgramImage,
    request: &ExecRequest,
    outcome: &Result<ExecResult, ExecError>,
    stdout: &[u8],
    stderr: &[u8],
) -> Value {
    let b64 = base64::engine::general_purpose::STANDARD;
    let (ok, exit_status, fuel_used, io, fault) = match outcome {
        Ok(result) => (
            result.success(),
            Value::from(result.exit_code),
            serde_json::json!(result.fuel_used),
            serde_json::json!(result.io),
            Value::Null,
        ),
        Err(err) => (
            false,
            Value::Null,
            Value::Null,
            Value::Null,
            Value::from(err.to_string()),
        ),
    };

    serde_json::json!({
        "schema_version": NIO_HOST_RUNNER_REPORT_SCHEMA_VERSION,
        "mode": "run",
        "ok": ok,
        "exit_status": exit_status,
        "image": {
            "source": image.source(),
            "sha256": image.sha256(),
            "size": image.size(),
        },
        "argv": request.argv(),
        "stdout_b64": b64.encode(stdout),
        "stderr_b64": b64.encode(stderr),
        "fuel_used": fuel_used,
        "io": io,
        "fault": fault,
    })
}
