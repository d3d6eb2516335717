//! rootup - root overlay installer command line interface

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use rootup::{Config, Depot, Error, Selector};

#[derive(Parser)]
#[command(name = "rootup")]
#[command(about = "apply roots over a destination tree, and peel them back off")]
#[command(version)]
struct Cli {
    /// increase verbosity (-vv for debug output)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// force operations past non-fatal errors
    #[arg(short, long)]
    force: bool,

    /// dry run: report actions without touching the tree or the catalog
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// destination prefix to operate on
    #[arg(short, long, default_value = "/")]
    prefix: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// install an archive or directory as a new layer
    Install {
        /// path to a root directory or tarball
        path: PathBuf,
    },

    /// install a root, then retire older layers with the same name
    Upgrade {
        /// path to a root directory or tarball
        path: PathBuf,
    },

    /// uninstall layers, restoring what each displaced
    Uninstall {
        /// uuid, serial, name, or newest|oldest|superseded|all
        selector: Selector,
    },

    /// list installed layers, newest first
    List {
        /// optional selector to narrow the listing
        selector: Option<Selector>,
    },

    /// print the file records of matching layers
    Files {
        /// uuid, serial, name, or newest|oldest|superseded|all
        selector: Selector,
    },

    /// compare recorded files against the live tree
    Verify {
        /// uuid, serial, name, or newest|oldest|superseded|all
        selector: Selector,
    },

    /// print every layer and record, rollback twins included
    Dump,
}

// exit codes: 0 ok, 1 generic failure, 2 depot locked, 4 bad prefix,
// 5 upgrade target not found, 6 depot unreadable, 11-16 depot-open
// failure per subcommand
const EXIT_LOCKED: u8 = 2;
const EXIT_BAD_PREFIX: u8 = 4;
const EXIT_NO_UPGRADE_TARGET: u8 = 5;
const EXIT_UNREADABLE: u8 = 6;

fn open_failure_code(command: &Commands) -> u8 {
    match command {
        Commands::Install { .. } => 11,
        Commands::Upgrade { .. } => 12,
        Commands::Uninstall { .. } => 13,
        Commands::List { .. } | Commands::Dump => 14,
        Commands::Files { .. } => 15,
        Commands::Verify { .. } => 16,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err((code, err)) => {
            eprintln!("error: {err}");
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<(), (u8, Error)> {
    let mut config = match Config::new(cli.prefix.clone()) {
        Ok(config) => config,
        Err(e) => return Err((EXIT_BAD_PREFIX, e)),
    };
    config.verbosity = cli.verbose;
    config.force = cli.force;
    config.dry_run = cli.dry_run;

    let mut depot = Depot::open(config).map_err(|e| {
        let code = match &e {
            Error::LockBusy(_) => EXIT_LOCKED,
            Error::DepotUnreadable { .. } => EXIT_UNREADABLE,
            _ => open_failure_code(&cli.command),
        };
        (code, e)
    })?;

    depot.check_consistency().map_err(generic)?;

    match cli.command {
        Commands::Install { path } => match depot.install(&path) {
            Ok(layer) => println!("{}", layer.store_name()),
            Err(e) => {
                // unwind the half-finished layer pair right away rather
                // than leaving it for the next run's consistency scan
                eprintln!("Install failed. Rolling back installation.");
                depot
                    .unwind_inactive()
                    .map_err(|u| (1, u))
                    .map(|()| eprintln!("Rollback successful."))?;
                return Err((1, e));
            }
        },

        Commands::Upgrade { path } => match depot.upgrade(&path) {
            Ok(layer) => println!("{}", layer.store_name()),
            Err(e @ Error::SelectorNotFound(_)) => return Err((EXIT_NO_UPGRADE_TARGET, e)),
            Err(e) => return Err(generic(e)),
        },

        Commands::Uninstall { selector } => {
            let layers = depot.resolve(&selector).map_err(generic)?;
            for layer in layers {
                depot.uninstall(&layer).map_err(generic)?;
            }
        }

        Commands::List { selector } => depot.list(selector.as_ref()).map_err(generic)?,

        Commands::Files { selector } => {
            let layers = depot.resolve(&selector).map_err(generic)?;
            for layer in layers {
                depot.files(&layer).map_err(generic)?;
            }
        }

        Commands::Verify { selector } => {
            let layers = depot.resolve(&selector).map_err(generic)?;
            for layer in layers {
                depot.verify(&layer).map_err(generic)?;
            }
        }

        Commands::Dump => depot.dump().map_err(generic)?,
    }

    Ok(())
}

fn generic(e: Error) -> (u8, Error) {
    let code = match &e {
        Error::LockBusy(_) => EXIT_LOCKED,
        Error::DepotUnreadable { .. } => EXIT_UNREADABLE,
        _ => 1,
    };
    (code, e)
}
