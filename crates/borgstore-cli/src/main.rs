//! BorgStore demo driver.
//!
//! Exercises a storage URL end to end: creates the store, writes items
//! into a flat and a nested namespace, lists them, soft-deletes one and
//! prints the statistics snapshot.

#![forbid(unsafe_code)]

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing_subscriber::{fmt, EnvFilter};

use borgstore::{LevelsConfig, Store};

/// Exercise a BorgStore storage URL end to end.
///
/// Careful: the given storage will be created and used; with --destroy it
/// is completely deleted afterwards.
#[derive(Parser)]
#[command(name = "borgstore", version, about)]
struct Cli {
    /// Storage URL, e.g. file:///tmp/borgstore_storage
    url: String,

    /// Destroy the storage when done instead of leaving it for inspection
    #[arg(long)]
    destroy: bool,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    // no nesting for the few config items, 2 levels for the data items
    let levels = LevelsConfig::new()
        .level("config/", &[0])
        .level("data/", &[2]);
    let mut store = Store::new(&cli.url, levels)?;
    store
        .create()
        .context("you must not give an existing, non-empty storage")?;

    store.open()?;
    let result = demo(&store);
    store.close()?;
    result?;

    if cli.destroy {
        store.destroy()?;
        println!("Storage destroyed.");
    } else {
        println!("Storage kept for inspection (pass --destroy to remove it).");
    }
    Ok(())
}

/// Content-derived key for the data namespace.
fn data_key(data: &[u8]) -> String {
    format!("data/{:x}", Sha256::digest(data))
}

fn names(store: &Store, namespace: &str, deleted: bool) -> anyhow::Result<Vec<String>> {
    let names = store
        .list(namespace, deleted)
        .map(|item| item.map(|item| item.name))
        .collect::<borgstore::Result<Vec<_>>>()?;
    Ok(names)
}

fn demo(store: &Store) -> anyhow::Result<()> {
    println!("Writing 2 items to the config namespace...");
    store.store("config/settings1", b"value1 = 42")?;
    store.store("config/settings2", b"value2 = 23")?;

    println!("config namespace contents: {:?}", names(store, "config", false)?);
    for key in ["config/settings1", "config/settings2"] {
        let value = store.load(key)?;
        println!("loaded {key}: {}", String::from_utf8_lossy(&value));
    }

    println!("Writing 2 items to the data namespace...");
    let data1 = b"some arbitrary binary data.".as_slice();
    let key1 = data_key(data1);
    store.store(&key1, data1)?;
    let data2 = b"more arbitrary binary data. more arbitrary binary data. ".as_slice();
    let key2 = data_key(data2);
    store.store(&key2, data2)?;

    println!("Soft-deleting item {key2} ...");
    store.soft_delete(&key2)?;

    println!("data namespace contents: {:?}", names(store, "data", false)?);
    println!(
        "data namespace soft-deleted contents: {:?}",
        names(store, "data", true)?
    );

    println!("Stats: {:#?}", store.stats());
    Ok(())
}
