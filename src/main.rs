use clap::Parser;
use flowq::cli::{Cli, Role};
use flowq::coordinator::{run_query, CoordinatorConfig, QueryResult};
use flowq::error::Result;
use flowq::output::{render_records, render_summary, OutputItems};
use flowq::progress::{ProgressDest, ProgressKind};
use flowq::task::{TaskSpec, WorkingMode};
use flowq::{cluster, worker};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, warn};
use tracing_subscriber::filter::LevelFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbosity);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    match cli.role() {
        Role::Worker { coordinator } => {
            let session = cluster::join(coordinator.as_str())?;
            worker::run(session, cli.num_threads.unwrap_or(0))
        }
        Role::Coordinator { listen, workers } => {
            let task = cli.build_task()?;
            let cluster = cluster::listen(listen.as_str(), workers)?;
            let result = run_query(cluster, &task, &config(cli)?)?;
            render(cli, &task, &result)
        }
        Role::Local { workers } => {
            let task = cli.build_task()?;
            let (cluster, handles) =
                cluster::spawn_local(workers, cli.num_threads.unwrap_or(0))?;
            let result = run_query(cluster, &task, &config(cli)?);
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("worker finished with: {e}"),
                    Err(_) => warn!("worker thread panicked"),
                }
            }
            render(cli, &task, &result?)
        }
    }
}

fn config(cli: &Cli) -> Result<CoordinatorConfig> {
    Ok(CoordinatorConfig {
        timeout: Duration::from_secs(cli.timeout),
        progress: ProgressKind::parse(&cli.progress_bar_type)?,
        progress_dest: ProgressDest::parse(&cli.progress_bar_dest),
    })
}

fn render(cli: &Cli, task: &TaskSpec, result: &QueryResult) -> Result<()> {
    let mut out = std::io::stdout().lock();
    let records = matches!(cli.output_items, OutputItems::Records | OutputItems::All);
    let summary = matches!(cli.output_items, OutputItems::Summary | OutputItems::All);

    if records && task.mode != WorkingMode::Meta {
        let layout = task.layout()?;
        render_records(&mut out, &layout, &result.records, cli.output_format)?;
    }
    if summary || task.mode == WorkingMode::Meta {
        render_summary(&mut out, task, &result.processed, &result.metadata)?;
    }
    Ok(())
}
