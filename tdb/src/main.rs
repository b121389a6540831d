#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tdb::{BTree, BTreeError, TreeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: tdb <db-path> <command>

commands:
  init                create an empty database
  insert <key> <val>  insert a key (fails if present)
  search <key>        print the value stored for a key
  remove <key>        remove a key
  traverse            print every key in order
  stats               validate the tree and print its shape
  dot <out>           write a Graphviz rendering of the tree
  compact <out>       copy live entries into a new database";

/// A parsed command line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Init,
    Insert { key: i64, value: u64 },
    Search { key: i64 },
    Remove { key: i64 },
    Traverse,
    Stats,
    Dot { out: PathBuf },
    Compact { out: PathBuf },
}

fn parse_args(args: &[String]) -> Result<(PathBuf, Command), String> {
    let [path, command, rest @ ..] = args else {
        return Err("missing database path or command".to_string());
    };

    let command = match (command.as_str(), rest) {
        ("init", []) => Command::Init,
        ("insert", [key, value]) => Command::Insert {
            key: parse_number("key", key)?,
            value: parse_number("value", value)?,
        },
        ("search", [key]) => Command::Search {
            key: parse_number("key", key)?,
        },
        ("remove", [key]) => Command::Remove {
            key: parse_number("key", key)?,
        },
        ("traverse", []) => Command::Traverse,
        ("stats", []) => Command::Stats,
        ("dot", [out]) => Command::Dot { out: out.into() },
        ("compact", [out]) => Command::Compact { out: out.into() },
        (other, _) => return Err(format!("unknown command or wrong arguments: {other}")),
    };

    Ok((PathBuf::from(path), command))
}

fn parse_number<T: std::str::FromStr>(what: &str, s: &str) -> Result<T, String> {
    s.parse().map_err(|_| format!("invalid {what}: '{s}'"))
}

fn run(path: &Path, command: Command, config: TreeConfig) -> Result<(), BTreeError> {
    if command == Command::Init {
        BTree::create(path, config)?.sync()?;
        tracing::info!("created {}", path.display());
        return Ok(());
    }

    let tree = BTree::open(path, config)?;
    match command {
        Command::Init => {}
        Command::Insert { key, value } => {
            tree.insert(key, value)?;
            tree.sync()?;
        }
        Command::Search { key } => match tree.get(key)? {
            Some(value) => println!("{value}"),
            None => println!("not found"),
        },
        Command::Remove { key } => {
            match tree.remove(key) {
                Ok(Some(value)) => println!("removed {key} (value {value})"),
                Ok(None) | Err(BTreeError::EmptyTree) => println!("not found"),
                Err(e) => return Err(e),
            }
            tree.sync()?;
        }
        Command::Traverse => {
            let entries = match tree.entries() {
                Err(BTreeError::EmptyTree) => Vec::new(),
                other => other?,
            };
            for (key, value) in entries {
                println!("{key}\t{value}");
            }
        }
        Command::Stats => {
            let stats = tree.validate()?;
            println!("nodes:             {}", stats.nodes);
            println!("leaves:            {}", stats.leaves);
            println!("height:            {}", stats.height);
            println!("live entries:      {}", stats.live_entries);
            println!("tombstones:        {}", stats.tombstones);
            println!("allocated pages:   {}", stats.allocated_pages);
            println!("unreachable pages: {}", stats.unreachable_pages);
        }
        Command::Dot { out } => tree.export_graph(&out)?,
        Command::Compact { out } => {
            tree.compact_into(&out)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tdb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (path, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let config = match TreeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::debug!(
        "configuration: half_degree={}, delete_strategy={:?}, max_cas_retries={}",
        config.half_degree,
        config.delete_strategy,
        config.max_cas_retries
    );

    match run(&path, command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(BTreeError::DuplicateKey(key)) => {
            eprintln!("key {key} already exists");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
