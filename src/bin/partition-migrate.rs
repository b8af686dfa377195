//! Partition migration operator CLI
//!
//! Inspects and controls jobs recorded in a durable progress ledger, and
//! runs end-to-end migrations against the simulated in-memory engine.

use clap::{Arg, ArgAction, ArgMatches, Command};
use partition_migrator::{
    engine::memory::CopyFault, logging, metrics, service::cancel_idle, InMemoryEngine, JobId,
    JobSpec, JobStatusReport, MigrationService, MigratorConfig, ProgressLedger,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let matches = create_cli().get_matches();

    let level = matches
        .get_one::<String>("log-level")
        .map(|s| logging::parse_level(s))
        .unwrap_or(tracing::Level::INFO);
    logging::init_logging(level, matches.get_flag("json-logs"));

    if let Err(e) = run_command(&matches) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn ledger_dir_arg() -> Arg {
    Arg::new("ledger-dir")
        .help("Progress ledger directory (defaults to the configured one)")
        .long("ledger-dir")
}

fn job_id_arg() -> Arg {
    Arg::new("job-id").help("Job identifier").required(true).index(1)
}

fn create_cli() -> Command {
    Command::new("partition-migrate")
        .about("Health-gated partition migration with atomic cutover")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .help("JSON configuration file")
                .long("config")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .help("Log level (trace, debug, info, warn, error)")
                .long("log-level")
                .default_value("info")
                .global(true),
        )
        .arg(
            Arg::new("json-logs")
                .help("Emit logs as JSON")
                .long("json-logs")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("simulate")
                .about("Migrate a generated table on the in-memory engine")
                .arg(ledger_dir_arg())
                .arg(
                    Arg::new("partitions")
                        .help("Number of source partitions")
                        .long("partitions")
                        .default_value("12"),
                )
                .arg(
                    Arg::new("rows")
                        .help("Rows per partition")
                        .long("rows")
                        .default_value("1000"),
                )
                .arg(
                    Arg::new("latency-ms")
                        .help("Simulated copy latency per partition")
                        .long("latency-ms")
                        .default_value("20"),
                )
                .arg(
                    Arg::new("flaky")
                        .help("Partition whose first two copies time out")
                        .long("flaky"),
                )
                .arg(
                    Arg::new("mutations")
                        .help("Outstanding mutations reported by the first gate polls")
                        .long("mutations")
                        .default_value("0"),
                )
                .arg(
                    Arg::new("no-cutover")
                        .help("Stop at completed instead of exchanging")
                        .long("no-cutover")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("dry-run")
                        .help("Only enumerate the units that would be migrated")
                        .long("dry-run")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show a job's progress")
                .arg(job_id_arg())
                .arg(ledger_dir_arg())
                .arg(
                    Arg::new("json")
                        .help("Print the report as JSON")
                        .long("json")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("list")
                .about("List jobs in the ledger")
                .arg(ledger_dir_arg()),
        )
        .subcommand(
            Command::new("cancel")
                .about("Mark a job failed; its target may then be discarded")
                .arg(job_id_arg())
                .arg(ledger_dir_arg()),
        )
        .subcommand(Command::new("metrics").about("Print Prometheus metrics of this process"))
}

fn run_command(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(matches)?;
    match matches.subcommand() {
        Some(("simulate", sub)) => cmd_simulate(sub, with_ledger_dir(config, sub)),
        Some(("status", sub)) => cmd_status(sub, with_ledger_dir(config, sub)),
        Some(("list", sub)) => cmd_list(with_ledger_dir(config, sub)),
        Some(("cancel", sub)) => cmd_cancel(sub, with_ledger_dir(config, sub)),
        Some(("metrics", _)) => {
            print!("{}", metrics::gather_text()?);
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command. Use --help to see available commands.");
            std::process::exit(1);
        }
    }
}

fn load_config(matches: &ArgMatches) -> Result<MigratorConfig, Box<dyn std::error::Error>> {
    let config = match matches.get_one::<String>("config") {
        Some(path) => MigratorConfig::from_file(path)?,
        None => MigratorConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn with_ledger_dir(mut config: MigratorConfig, matches: &ArgMatches) -> MigratorConfig {
    if let Some(dir) = matches.get_one::<String>("ledger-dir") {
        config.ledger_dir = PathBuf::from(dir);
    }
    config
}

fn parse_arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<T, String> {
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| format!("missing --{}", name))?;
    raw.parse()
        .map_err(|_| format!("invalid value for --{}: {}", name, raw))
}

fn cmd_simulate(matches: &ArgMatches, mut config: MigratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let partitions: usize = parse_arg(matches, "partitions")?;
    let rows: u64 = parse_arg(matches, "rows")?;
    let latency: u64 = parse_arg(matches, "latency-ms")?;
    let mutations: u64 = parse_arg(matches, "mutations")?;
    if matches.get_flag("no-cutover") {
        config.auto_cutover = false;
    }

    let engine = Arc::new(InMemoryEngine::new().with_copy_latency(Duration::from_millis(latency)));
    let names: Vec<String> = (0..partitions).map(|i| format!("2024{:02}", i + 1)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    engine.seed("events", "events_v2", &refs, rows);
    if let Some(flaky) = matches.get_one::<String>("flaky") {
        engine.inject_copy_fault(flaky, CopyFault::PartialThenTransient, 2);
    }
    if mutations > 0 {
        engine.script_outstanding_mutations([mutations, mutations]);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(simulate(engine, config, matches.get_flag("dry-run")))
}

async fn simulate(
    engine: Arc<InMemoryEngine>,
    config: MigratorConfig,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec = JobSpec::new("events", "events_v2", "toYYYYMM(ts)");
    let service = MigrationService::open(engine.clone(), config)?;

    if dry_run {
        let preview = service.plan_only(&spec).await?;
        println!(
            "Would migrate {} partitions ({} rows, {} bytes) from {} into {}",
            preview.units.len(),
            preview.total_rows,
            preview.total_bytes,
            preview.source,
            preview.target
        );
        for unit in &preview.units {
            println!("  {} ({} rows)", unit.id, unit.estimated_rows);
        }
        return Ok(());
    }

    let job_id = service.start(spec).await?;
    println!("Started job {}", job_id);
    let outcome = service.wait(&job_id).await?;
    println!("Outcome: {:?}\n", outcome);
    print!("{}", service.status(&job_id)?.format_detailed());
    println!(
        "\nCopies issued: {}, peak concurrency: {}",
        engine.total_copy_calls(),
        engine.peak_concurrent_copies()
    );
    Ok(())
}

fn cmd_status(matches: &ArgMatches, config: MigratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = ProgressLedger::open(&config.ledger_dir)?;
    let job_id = JobId::new(parse_arg::<String>(matches, "job-id")?);
    let report = JobStatusReport::build(&ledger, &job_id)?;
    if matches.get_flag("json") {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.format_detailed());
    }
    Ok(())
}

fn cmd_list(config: MigratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = ProgressLedger::open(&config.ledger_dir)?;
    let jobs = ledger.list_jobs()?;
    if jobs.is_empty() {
        println!("No jobs in {}", config.ledger_dir.display());
        return Ok(());
    }
    for job in jobs {
        println!("{}", JobStatusReport::build(&ledger, &job.id)?.summary_line());
    }
    Ok(())
}

fn cmd_cancel(matches: &ArgMatches, config: MigratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = ProgressLedger::open(&config.ledger_dir)?;
    let job_id = JobId::new(parse_arg::<String>(matches, "job-id")?);
    cancel_idle(&ledger, &job_id)?;
    println!("Cancelled job {}", job_id);
    Ok(())
}
