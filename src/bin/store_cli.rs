use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgMatches, Command};
use tracing_subscriber::EnvFilter;

use eikyu_store::{Store, StoreConfig};

fn cli() -> ArgMatches {
    Command::new("eikyu-store")
        .about("Inspect and maintain an eikyu-store data directory")
        .version(env!("CARGO_PKG_VERSION"))
        .author("hackiado <seidogitan@example.com>")
        .arg(
            Arg::new("dir")
                .long("dir")
                .short('d')
                .global(true)
                .default_value(".")
                .help("Store data directory"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .help("JSON config file (overrides --dir and all defaults)"),
        )
        .subcommand(Command::new("check").about("Verify store invariants without changing anything"))
        .subcommand(Command::new("repair").about("Rebuild the index and free-space map from the blob file"))
        .subcommand(
            Command::new("sweep")
                .about("Delete every id not covered by the current mark set")
                .arg(
                    Arg::new("keep")
                        .long("keep")
                        .help("Id to mark as kept before sweeping (repeatable)")
                        .action(clap::ArgAction::Append)
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(Command::new("defragment").about("Rewrite the blob file, eliminating holes"))
        .subcommand(Command::new("stats").about("Print entry count and recovery status"))
        .get_matches()
}

fn open_store(matches: &ArgMatches) -> eikyu_store::Result<Store> {
    let config = match matches.get_one::<String>("config") {
        Some(path) => StoreConfig::load(path)?,
        None => {
            let dir: PathBuf = matches.get_one::<String>("dir").unwrap().into();
            StoreConfig::new(dir)
        }
    };
    Store::open(config)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let matches = cli();

    let result = match matches.subcommand() {
        Some(("check", _)) => run_check(&matches, false),
        Some(("repair", _)) => run_check(&matches, true),
        Some(("sweep", sub)) => run_sweep(&matches, sub),
        Some(("defragment", _)) => run_defragment(&matches),
        Some(("stats", _)) => run_stats(&matches),
        _ => {
            eprintln!("no subcommand given, try --help");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn run_check(matches: &ArgMatches, repair: bool) -> eikyu_store::Result<ExitCode> {
    let mut store = open_store(matches)?;
    let report = store.check(repair)?;
    for finding in &report.findings {
        println!("{finding}");
    }
    println!(
        "{} finding(s){}",
        report.error_count(),
        if repair { " (repaired)" } else { "" }
    );
    store.sync()?;
    Ok(if report.error_count() > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn run_sweep(matches: &ArgMatches, sub: &ArgMatches) -> eikyu_store::Result<ExitCode> {
    let mut store = open_store(matches)?;
    store.clear_marks()?;
    if let Some(keep) = sub.get_many::<u64>("keep") {
        for id in keep {
            store.mark(*id)?;
        }
    }
    let deleted = store.sweep()?;
    println!("deleted {} record(s)", deleted.len());
    store.sync()?;
    Ok(ExitCode::SUCCESS)
}

fn run_defragment(matches: &ArgMatches) -> eikyu_store::Result<ExitCode> {
    let mut store = open_store(matches)?;
    store.defragment()?;
    store.sync()?;
    println!("defragmented");
    Ok(ExitCode::SUCCESS)
}

fn run_stats(matches: &ArgMatches) -> eikyu_store::Result<ExitCode> {
    let mut store = open_store(matches)?;
    println!("entries: {}", store.entries_count());
    println!(
        "recovered from unclean shutdown: {}",
        store.was_recovered_from_unclean_shutdown()
    );
    Ok(ExitCode::SUCCESS)
}
