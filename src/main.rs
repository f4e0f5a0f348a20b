//! Command-line runner: multiply two generated matrices with Cannon's
//! algorithm on an in-process grid of ranks.
//!
//! Run with: cargo run --release -- --procs 16 --size 16 --print
//!
//! Or, built with `--features mpi`, one process per rank:
//! mpiexec -n 16 target/release/ferrocannon --mpi --size 16 --print

use clap::Parser;
#[cfg(feature = "mpi")]
use ferrocannon::Mpi;
use ferrocannon::{cannon, CannonConfig, Error, Operand, Report, Universe};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ferrocannon",
    version,
    about = "Distributed dense matrix multiplication with Cannon's algorithm"
)]
struct Cli {
    /// Number of ranks; must be a perfect square. Ignored with --mpi.
    #[arg(short = 'p', long, default_value_t = 4)]
    procs: i32,

    /// Global matrix edge N; must be divisible by sqrt(procs).
    #[arg(short = 'n', long, default_value_t = 16)]
    size: usize,

    /// Left operand: uniform[:v], identity, pattern or random[:seed].
    #[arg(long, default_value = "uniform")]
    operand_a: Operand,

    /// Right operand: uniform[:v], identity, pattern or random[:seed].
    #[arg(long, default_value = "uniform")]
    operand_b: Operand,

    /// Skip the initial skew (only correct for uniform operands).
    #[arg(long)]
    no_align: bool,

    /// Print the assembled matrix.
    #[arg(long)]
    print: bool,

    /// Compare against a serial product and report the largest error.
    #[arg(long)]
    verify: bool,

    /// Run over MPI, one process per rank, as started by mpiexec.
    #[cfg(feature = "mpi")]
    #[arg(long)]
    mpi: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_thread_names(true)
        .init();

    let cli = Cli::parse();
    let config = CannonConfig::with_size(cli.size)
        .operands(cli.operand_a, cli.operand_b)
        .aligned(!cli.no_align);

    launch(&cli, &config)
}

#[cfg(not(feature = "mpi"))]
fn launch(cli: &Cli, config: &CannonConfig) -> ExitCode {
    run_threads(cli, config)
}

#[cfg(feature = "mpi")]
fn launch(cli: &Cli, config: &CannonConfig) -> ExitCode {
    if cli.mpi {
        run_mpi(cli, config)
    } else {
        run_threads(cli, config)
    }
}

fn run_threads(cli: &Cli, config: &CannonConfig) -> ExitCode {
    let outcomes = match Universe::run(cli.procs, |world| cannon::multiply(&world, config)) {
        Ok(outcomes) => outcomes,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut report = None;
    for (rank, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(Some(r)) => report = Some(r),
            Ok(None) => {}
            // Every rank reports the same configuration error; print it once.
            Err(Error::Config(e)) if rank as i32 == config.coordinator => {
                eprintln!("\n{e}.");
                return ExitCode::FAILURE;
            }
            Err(Error::Config(_)) => {}
            Err(e) => {
                eprintln!("rank {rank}: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    let Some(report) = report else {
        eprintln!("error: coordinator produced no result");
        return ExitCode::FAILURE;
    };
    print_report(cli, config, &report);
    ExitCode::SUCCESS
}

#[cfg(feature = "mpi")]
fn run_mpi(cli: &Cli, config: &CannonConfig) -> ExitCode {
    let mpi = match Mpi::init() {
        Ok(mpi) => mpi,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let world = mpi.world();
    match cannon::multiply(&world, config) {
        Ok(Some(report)) => {
            print_report(cli, config, &report);
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(Error::Config(e)) => {
            if world.rank() == config.coordinator {
                eprintln!("\n{e}.");
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("rank {}: {e}", world.rank());
            if let Some(code) = e.abort_code() {
                world.abort(code);
            }
            ExitCode::FAILURE
        }
    }
}

fn print_report(cli: &Cli, config: &CannonConfig, report: &Report) {
    if cli.print {
        println!("\n---------Printing global matrix-C---------");
        print!("{}", report.result);
    }
    if cli.verify {
        println!("\nMax abs error vs serial product = {:e}", report.max_abs_error(config));
    }
    println!(
        "\nProgram running time = {:.6}, processes used = {}",
        report.elapsed, report.processes
    );
}
