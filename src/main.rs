use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use nomad_lrms::config::BackendConfig;
use nomad_lrms::scheduler::{JobHandle, JobSpec, JobState};
use nomad_lrms::shutdown::install_shutdown_handler;
use nomad_lrms::transport::LocalTransport;
use nomad_lrms::worker::{Controller, UsageReport};

#[derive(Parser, Debug)]
#[command(name = "nomad-lrms")]
#[command(version)]
#[command(about = "Run batch jobs detached on this host with resource accounting")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    host: HostArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Verify the measurement utility works
    Check,

    /// Submit a job and wait for it to finish
    Run(RunArgs),

    /// Show capacity and every job in the ledger
    Status,

    /// Ask a job to terminate
    Cancel {
        /// Process id from `status`
        pid: u32,
    },

    /// Remove a terminated job's execution directory and ledger entry
    Free {
        /// Process id from `status`
        pid: u32,
    },
}

// =============================================================================
// Host Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct HostArgs {
    /// State directory holding the spool and the ledger
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// GNU time compatible measurement utility
    #[arg(long, global = true)]
    time_cmd: Option<PathBuf>,

    /// Cores the ledger may hand out (default: nproc)
    #[arg(long, global = true)]
    host_cores: Option<u32>,

    /// Memory in bytes the ledger may hand out (default: MemTotal)
    #[arg(long, global = true)]
    host_memory: Option<u64>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Cores to reserve
    #[arg(long, default_value = "1")]
    cores: u32,

    /// Memory in bytes to reserve
    #[arg(long, default_value = "0")]
    memory: u64,

    /// Environment variable, NAME=VALUE (repeatable)
    #[arg(long = "env", short = 'e')]
    env: Vec<String>,

    /// File to stage, SOURCE:TARGET with TARGET relative to the job directory
    #[arg(long = "input", short = 'i')]
    inputs: Vec<String>,

    /// Stdin file relative to the job directory
    #[arg(long)]
    stdin: Option<String>,

    /// Stdout file relative to the job directory
    #[arg(long)]
    stdout: Option<String>,

    /// Stderr file relative to the job directory
    #[arg(long, conflicts_with = "join")]
    stderr: Option<String>,

    /// Send stderr to the stdout file
    #[arg(long)]
    join: bool,

    /// Return right after submission
    #[arg(long)]
    detach: bool,

    /// Keep the execution directory after the job finished
    #[arg(long)]
    keep: bool,

    /// Command line to execute
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobOutput {
    job_id: String,
    pid: Option<u32>,
    state: String,
    cores: u32,
    memory: u64,
    exec_dir: Option<String>,
    exit_status: Option<String>,
    failure: Option<String>,
    usage: Option<UsageReport>,
}

#[derive(Serialize)]
struct StatusOutput {
    total_cores: u32,
    total_memory: u64,
    available_cores: u32,
    available_memory: u64,
    jobs: Vec<JobOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn backend_config(args: &HostArgs) -> BackendConfig {
    let mut config = match &args.state_dir {
        Some(dir) => BackendConfig::rooted_at(dir),
        None => BackendConfig::default(),
    };
    if let Some(time_cmd) = &args.time_cmd {
        config.time_cmd = time_cmd.clone();
    }
    config.total_cores = args.host_cores;
    config.total_memory = args.host_memory;
    config
}

fn job_spec(args: &RunArgs) -> Result<JobSpec, Box<dyn std::error::Error>> {
    let mut spec = JobSpec::new(args.command.iter().cloned()).with_resources(args.cores, args.memory);
    for pair in &args.env {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid --env {:?}, expected NAME=VALUE", pair))?;
        spec = spec.with_env(name, value);
    }
    for pair in &args.inputs {
        let (source, target) = pair
            .split_once(':')
            .ok_or_else(|| format!("invalid --input {:?}, expected SOURCE:TARGET", pair))?;
        spec = spec.with_input(source, target);
    }
    spec.stdin = args.stdin.clone();
    spec.stdout = args.stdout.clone();
    spec.stderr = args.stderr.clone();
    spec.join = args.join;
    Ok(spec)
}

fn job_output(handle: &JobHandle) -> JobOutput {
    JobOutput {
        job_id: handle.id.to_string(),
        pid: handle.pid(),
        state: handle.state().to_string(),
        cores: handle.spec.cores,
        memory: handle.spec.memory,
        exec_dir: handle.exec_dir().map(|dir| dir.display().to_string()),
        exit_status: handle.exit_status().map(|status| status.to_string()),
        failure: handle.failure().map(str::to_string),
        usage: handle.usage().cloned(),
    }
}

fn print_job(handle: &JobHandle, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let output = job_output(handle);
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:      {}", output.job_id);
            if let Some(pid) = output.pid {
                println!("PID:         {}", pid);
            }
            println!("State:       {}", output.state);
            if let Some(dir) = &output.exec_dir {
                println!("Directory:   {}", dir);
            }
            if let Some(status) = &output.exit_status {
                println!("Exit Status: {}", status);
            }
            if let Some(failure) = &output.failure {
                println!("Failure:     {}", failure);
            }
            if let Some(usage) = &output.usage {
                println!("Wall Time:   {:.2}s", usage.wall_time);
                println!("CPU Time:    {:.2}s user, {:.2}s system", usage.user_time, usage.kernel_time);
                println!("Max RSS:     {} bytes", usage.max_resident_memory);
            }
        }
    }
    Ok(())
}

async fn connect(host: &HostArgs) -> Result<Controller, Box<dyn std::error::Error>> {
    let config = backend_config(host);
    Ok(Controller::connect(Arc::new(LocalTransport::new()), config).await?)
}

async fn find_job(
    controller: &Controller,
    pid: u32,
) -> Result<JobHandle, Box<dyn std::error::Error>> {
    controller
        .recover()
        .await?
        .into_iter()
        .find(|handle| handle.pid() == Some(pid))
        .ok_or_else(|| format!("no job with pid {} in the ledger", pid).into())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_check(host: &HostArgs) -> Result<(), Box<dyn std::error::Error>> {
    let controller = connect(host).await?;
    controller.check_time_cmd().await?;
    let capacity = controller.capacity().await;
    println!(
        "{} works; {} cores and {} bytes of memory under management",
        controller.config().time_cmd.display(),
        capacity.cores,
        capacity.memory
    );
    Ok(())
}

async fn handle_run(
    host: &HostArgs,
    args: RunArgs,
    output_format: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    let controller = connect(host).await?;
    controller.check_time_cmd().await?;

    let mut handle = JobHandle::new(job_spec(&args)?);
    controller.submit(&mut handle).await?;
    if args.detach {
        print_job(&handle, output_format)?;
        return Ok(0);
    }

    let shutdown = install_shutdown_handler()?;
    let mut state = controller.wait_for_termination(&mut handle, &shutdown).await?;
    if state.is_active() {
        eprintln!("Interrupted, cancelling job...");
        controller.cancel(&mut handle).await?;
        state = controller
            .wait_for_termination(&mut handle, &CancellationToken::new())
            .await?;
    }
    print_job(&handle, output_format)?;

    let code = match handle.usage() {
        Some(usage) if handle.failure().is_none() => usage.return_code,
        _ => 1,
    };
    if state == JobState::Terminating && !args.keep {
        controller.free(&mut handle).await?;
    }
    Ok(code)
}

async fn handle_status(
    host: &HostArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let controller = connect(host).await?;
    let mut handles = controller.recover().await?;
    for handle in handles.iter_mut() {
        if let Err(e) = controller.poll(handle).await {
            tracing::warn!(pid = ?handle.pid(), error = %e, "Could not poll job");
        }
    }
    let capacity = controller.capacity().await;
    let (available_cores, available_memory) = controller.available().await;

    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput {
                total_cores: capacity.cores,
                total_memory: capacity.memory,
                available_cores,
                available_memory,
                jobs: handles.iter().map(job_output).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!(
                "Cores:  {} of {} free",
                available_cores, capacity.cores
            );
            println!(
                "Memory: {} of {} bytes free",
                available_memory, capacity.memory
            );
            println!();
            if handles.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<8} {:<12} {:<6} {:<12} DIRECTORY", "PID", "STATE", "CORES", "MEMORY");
                println!("{}", "-".repeat(78));
                for handle in &handles {
                    println!(
                        "{:<8} {:<12} {:<6} {:<12} {}",
                        handle.pid().map(|pid| pid.to_string()).unwrap_or_else(|| "-".into()),
                        handle.state(),
                        handle.spec.cores,
                        handle.spec.memory,
                        handle
                            .exec_dir()
                            .map(|dir| dir.display().to_string())
                            .unwrap_or_default()
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_cancel(host: &HostArgs, pid: u32) -> Result<(), Box<dyn std::error::Error>> {
    let controller = connect(host).await?;
    let mut handle = find_job(&controller, pid).await?;
    controller.cancel(&mut handle).await?;
    println!("Termination requested for job {}", pid);
    Ok(())
}

async fn handle_free(host: &HostArgs, pid: u32) -> Result<(), Box<dyn std::error::Error>> {
    let controller = connect(host).await?;
    let mut handle = find_job(&controller, pid).await?;
    controller.poll(&mut handle).await?;
    controller.free(&mut handle).await?;
    println!("Job {} freed", pid);
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let result = match args.command {
        Commands::Check => handle_check(&args.host).await.map(|_| 0),
        Commands::Run(run) => handle_run(&args.host, run, &args.output).await,
        Commands::Status => handle_status(&args.host, &args.output).await.map(|_| 0),
        Commands::Cancel { pid } => handle_cancel(&args.host, pid).await.map(|_| 0),
        Commands::Free { pid } => handle_free(&args.host, pid).await.map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
