use std::io::{BufRead as _, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nio_contracts::ENV_LOG;
use nio_host_runner::{
    run_report, ExecError, ExecOutput, ExecRequest, ImageCache, ImageConfig, RunnerLimits,
    Session, SessionOptions, StdinPolicy,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nio-host-runner")]
#[command(about = "Runs the nio WebAssembly CLI against an in-memory filesystem.")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ImageArgs {
    /// http(s):// URL, file:// URL or path of the program image.
    #[arg(long, value_name = "LOC")]
    image: Option<String>,

    #[arg(long, value_name = "HEX")]
    sha256: Option<String>,
}

#[derive(Args)]
struct LimitArgs {
    #[arg(long)]
    fuel: Option<u64>,

    #[arg(long, value_name = "BYTES")]
    max_memory_bytes: Option<usize>,

    #[arg(long, value_name = "BYTES")]
    max_output_bytes: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the program once against a fresh filesystem.
    Run {
        #[command(flatten)]
        image: ImageArgs,

        #[command(flatten)]
        limits: LimitArgs,

        /// File whose content becomes the program's stdin.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Print a JSON report instead of the program's output.
        #[arg(long)]
        json: bool,

        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Feed stdin lines to the program one execution at a time.
    Repl {
        #[command(flatten)]
        image: ImageArgs,

        #[command(flatten)]
        limits: LimitArgs,

        /// Arguments of each execution.
        #[arg(long, num_args = 1.., default_value = "parse", allow_hyphen_values = true)]
        task: Vec<String>,

        #[arg(long, value_enum, default_value_t = StdinPolicy::Accumulate)]
        stdin_policy: StdinPolicy,
    },
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    match cli.command {
        Command::Run {
            image,
            limits,
            input,
            json,
            args,
        } => {
            let owned = image_override(&image);
            let cache = owned.as_ref().unwrap_or_else(|| ImageCache::global());
            let limits = runner_limits(&limits)?;
            runtime.block_on(cmd_run(cache, limits, input, json, args))
        }
        Command::Repl {
            image,
            limits,
            task,
            stdin_policy,
        } => {
            let owned = image_override(&image);
            let cache = owned.as_ref().unwrap_or_else(|| ImageCache::global());
            let options = SessionOptions {
                stdin_policy,
                limits: runner_limits(&limits)?,
                ..SessionOptions::default()
            };
            runtime.block_on(cmd_repl(cache, options, task))
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// A dedicated cache when the command line overrides the image, otherwise
/// `None` so the process-wide cache is used.
fn image_override(args: &ImageArgs) -> Option<ImageCache> {
    if args.image.is_none() && args.sha256.is_none() {
        return None;
    }
    let mut config = ImageConfig::from_env();
    if let Some(location) = &args.image {
        config.location = location.clone();
    }
    if let Some(pin) = &args.sha256 {
        config.sha256 = Some(pin.trim().to_ascii_lowercase());
    }
    Some(ImageCache::from_config(&config))
}

fn runner_limits(args: &LimitArgs) -> Result<RunnerLimits> {
    Ok(RunnerLimits::from_env()?.merged(RunnerLimits {
        fuel: args.fuel,
        max_memory_bytes: args.max_memory_bytes,
        max_output_bytes: args.max_output_bytes,
    }))
}

async fn cmd_run(
    cache: &ImageCache,
    limits: RunnerLimits,
    input: Option<PathBuf>,
    json: bool,
    args: Vec<String>,
) -> Result<ExitCode> {
    let options = SessionOptions {
        limits,
        ..SessionOptions::default()
    };
    let session = Session::load(cache, options).await?;

    if let Some(path) = &input {
        let bytes =
            std::fs::read(path).with_context(|| format!("read input: {}", path.display()))?;
        session.append_stdin(bytes).await?;
    }

    let request = ExecRequest::new(args);
    let outcome = session.exec(request.clone()).await;
    let stdout = session.stdout().await;
    let stderr = session.stderr().await;

    if json {
        let report = run_report(session.image(), &request, &outcome, &stdout, &stderr);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        std::io::stdout().write_all(&stdout).context("write stdout")?;
        std::io::stderr().write_all(&stderr).context("write stderr")?;
    }

    match outcome {
        Ok(result) => Ok(ExitCode::from(u8::try_from(result.exit_code).unwrap_or(1))),
        Err(err @ ExecError::Fault { .. }) => {
            if !json {
                eprintln!("{err}");
            }
            Ok(ExitCode::from(2))
        }
        Err(err) => Err(err.into()),
    }
}

async fn cmd_repl(
    cache: &ImageCache,
    options: SessionOptions,
    task: Vec<String>,
) -> Result<ExitCode> {
    let session = Session::load(cache, options).await?;
    print_exec(&session.exec_capture(ExecRequest::new(["--version"])).await)?;

    for line in std::io::stdin().lock().lines() {
        let line = line.context("read stdin")?;
        session.append_stdin(format!("{line}\n")).await?;
        let output = session.exec_capture(ExecRequest::new(task.iter().cloned())).await;
        print_exec(&output)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn print_exec(output: &Result<ExecOutput, ExecError>) -> Result<()> {
    match output {
        Ok(out) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&out.stdout).context("write stdout")?;
            stdout.flush().context("flush stdout")?;
            std::io::stderr().write_all(&out.stderr).context("write stderr")?;
        }
        Err(err) => eprintln!("{err}"),
    }
    Ok(())
}
