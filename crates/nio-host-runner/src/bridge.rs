use std::fmt;
use std::time::Instant;

use nio_contracts::{ENTRY_POINT_EXPORT, PROGRAM_NAME};
use nio_vfs::Vfs;
use serde::Serialize;
use tracing::{debug, info};
use wasmtime::{Store, Trap};

use crate::config::RunnerLimits;
use crate::image::ProgramImage;
use crate::wasi::{IoStats, ProcExit, WasiHost};

/// Exit codes at or above this are not program exits.
const EXIT_CODE_LIMIT: u32 = 126;

/// Arguments for one run. `argv[0]` is supplied by the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub args: Vec<String>,
}

impl ExecRequest {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecRequest {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(PROGRAM_NAME.to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub exit_code: i32,
    /// Fuel consumed, when a fuel budget was set.
    pub fuel_used: Option<u64>,
    pub io: IoStats,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The instance trapped, ran out of fuel, hit the output cap, or exited
    /// with a status outside the program range.
    Fault { trap: String },
    /// The instance could not be created.
    Instantiate { message: String },
    /// Another execution holds the session.
    Busy,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Fault { trap } => write!(f, "program fault: {trap}"),
            ExecError::Instantiate { message } => write!(f, "instantiate program: {message}"),
            ExecError::Busy => write!(f, "session is busy"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Everything about a run other than its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerConfig {
    /// `KEY=VALUE` pairs visible through `environ_get`. Empty by default.
    pub env: Vec<(String, String)>,
    pub limits: RunnerLimits,
}

enum Termination {
    Returned,
    Exited(u32),
    Trapped(anyhow::Error),
}

/// Runs one fresh instance of `image` against `vfs`.
///
/// The instance owns `vfs` while it runs and hands it back afterwards,
/// including when the run fails.
pub fn run(
    image: &ProgramImage,
    vfs: &mut Vfs,
    request: &ExecRequest,
    config: &RunnerConfig,
) -> Result<ExecResult, ExecError> {
    let argv = request.argv();
    debug!(argv = ?argv, sha256 = %image.sha256(), "exec start");
    let started = Instant::now();

    let host = WasiHost::new(std::mem::take(vfs), argv, &config.env, &config.limits);
    let mut store = Store::new(image.engine(), host);
    store.limiter(|host| host.limiter());

    let budget = config.limits.fuel.unwrap_or(u64::MAX);
    let outcome = match store.set_fuel(budget) {
        Ok(()) => start(&mut store, image),
        Err(err) => Err(ExecError::Instantiate {
            message: format!("set fuel: {err:#}"),
        }),
    };
    let fuel_used = config
        .limits
        .fuel
        .and_then(|budget| store.get_fuel().ok().map(|left| budget.saturating_sub(left)));

    let host = store.into_data();
    let io = host.io();
    *vfs = host.into_vfs();

    let exit_code = outcome.and_then(classify);
    match &exit_code {
        Ok(code) => debug!(
            exit_code = code,
            fuel_used = ?fuel_used,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exec done"
        ),
        Err(err) => info!("exec failed: {err}"),
    }
    Ok(ExecResult {
        exit_code: exit_code?,
        fuel_used,
        io,
    })
}

fn start(store: &mut Store<WasiHost>, image: &ProgramImage) -> Result<Termination, ExecError> {
    let instance = image
        .instance_pre()
        .instantiate(&mut *store)
        .map_err(|err| ExecError::Instantiate {
            message: format!("{err:#}"),
        })?;
    let entry = instance
        .get_typed_func::<(), ()>(&mut *store, ENTRY_POINT_EXPORT)
        .map_err(|err| ExecError::Instantiate {
            message: format!("{err:#}"),
        })?;

    Ok(match entry.call(&mut *store, ()) {
        Ok(()) => Termination::Returned,
        Err(err) => match err.downcast_ref::<ProcExit>() {
            Some(exit) => Termination::Exited(exit.0),
            None => Termination::Trapped(err),
        },
    })
}

fn classify(termination: Termination) -> Result<i32, ExecError> {
    match termination {
        Termination::Returned => Ok(0),
        Termination::Exited(code) if code < EXIT_CODE_LIMIT => Ok(code as i32),
        Termination::Exited(code) => Err(ExecError::Fault {
            trap: format!("exit status {code} outside of [0, {EXIT_CODE_LIMIT})"),
        }),
        Termination::Trapped(err) => {
            debug!("guest trap: {err:?}");
            let trap = match err.downcast_ref::<Trap>() {
                Some(Trap::OutOfFuel) => "fuel exhausted".to_string(),
                Some(trap) => trap.to_string(),
                None => format!("{}", err.root_cause()),
            };
            Err(ExecError::Fault { trap })
        }
    }
}
