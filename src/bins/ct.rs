use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use coretap::errors::{DebuggerError, Result};
use coretap::process::Process;
use coretap::replay;
use coretap::sym::TableOracle;

/// Process-control core driver
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log everything the core does
    #[clap(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch a binary under the debugger and run it to completion
    Exec {
        /// The program to launch as debuggee
        program: PathBuf,
        /// Arguments passed to the debuggee
        args: Vec<String>,
    },
    /// Attach to a running process, list its threads, detach again
    Attach { pid: i32 },
    /// Record an execution for later replay
    Record {
        program: PathBuf,
        args: Vec<String>,
    },
    /// Replay a recording and report the position in history
    Replay { recording: PathBuf },
    /// Print version information
    Version,
}

fn main() -> std::result::Result<(), DebuggerError> {
    let args = Args::parse();
    setup_logger(args.verbose);

    // only one record/replay backend is shipped; the variable exists so
    // scripts written against other backends fail loudly instead of
    // silently recording with the wrong tool
    if let Ok(backend) = std::env::var("CORETAP_BACKEND") {
        if backend != "undo" {
            error!("unsupported record/replay backend: {backend}");
            return Err(DebuggerError::BackendUnavailable);
        }
    }

    match args.command {
        Command::Exec { program, args } => exec(program, args),
        Command::Attach { pid } => attach(pid),
        Command::Record { program, args } => {
            let mut cmd = vec![program.to_string_lossy().to_string()];
            cmd.extend(args);
            let recording = replay::record(&cmd, None)?;
            println!("{}", recording.display());
            Ok(())
        }
        Command::Replay { recording } => replay_recording(recording),
        Command::Version => {
            println!("coretap {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn exec(program: PathBuf, args: Vec<String>) -> Result<()> {
    let oracle = Arc::new(TableOracle::from_executable(&program)?);
    let mut process = Process::launch(
        &program,
        &args,
        None,
        &coretap::driver::linux::Redirects::default(),
        oracle,
    )?;
    info!("launched {} as pid {}", program.display(), process.pid());

    loop {
        match process.cont() {
            Ok(ev) => info!("stopped: {ev:?} at {}", process.pc()?),
            Err(DebuggerError::ProcessExited { pid, status }) => {
                info!("process {pid} exited with status {status}");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

fn attach(pid: i32) -> Result<()> {
    let oracle = Arc::new(TableOracle::new());
    let process = Process::attach(pid, oracle)?;
    for thread in process.threads() {
        println!(
            "thread {} {} at {}",
            thread.tid,
            if thread.running { "running" } else { "stopped" },
            thread.pc
        );
    }
    process.detach(false)
}

fn replay_recording(recording: PathBuf) -> Result<()> {
    let oracle = Arc::new(TableOracle::new());
    let mut process = replay::replay(&recording, oracle)?;
    println!("{}", process.when()?);
    for checkpoint in process.checkpoints()? {
        println!("c{} {} {:?}", checkpoint.id, checkpoint.when, checkpoint.note);
    }
    process.detach(true)
}

fn setup_logger(verbose: bool) {
    let level = if verbose {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    // construct a subscriber that prints formatted traces to stdout
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .without_time()
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
}
