//! Command-line front-end for the keeply backup engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use keeply_core::config::EngineConfig;
use keeply_core::error::{KeeplyError, Result};
use keeply_core::store::MetadataStore;
use keeply_core::{run_backup, telemetry};

#[derive(Parser, Debug)]
#[command(name = "keeply", about = "Incremental, content-addressed file backup engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan `root` and back up changed files into `dest`.
    Scan {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        dest: PathBuf,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// List recent backup runs.
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
    },
}

fn main() -> ExitCode {
    telemetry::init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Scan { root, dest, password, exclude } => cmd_scan(root, dest, password, exclude),
        Command::History { limit, dest, password } => cmd_history(limit, dest, password),
    };

    match result {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn resolve_password(password: Option<String>) -> Result<String> {
    password
        .or_else(|| std::env::var("KEEPLY_PASSWORD").ok())
        .ok_or_else(|| KeeplyError::Config("a password is required (--password or KEEPLY_PASSWORD)".into()))
}

fn cmd_scan(root: PathBuf, dest: PathBuf, password: Option<String>, exclude: Vec<String>) -> Result<()> {
    let passphrase = resolve_password(password)?;
    let cfg = EngineConfig::new(root, dest).with_excludes(exclude);
    let cancel = Arc::new(AtomicBool::new(false));

    let outcome = run_backup(&cfg, &passphrase, cancel, |done, total| {
        tracing::info!(done, total, "backup progress");
    })?;

    println!(
        "scan_id={} backup_type={:?} files_processed={} errors={} status={:?}",
        outcome.scan_id, outcome.backup_type, outcome.files_processed, outcome.errors, outcome.status
    );
    Ok(())
}

fn cmd_history(limit: i64, dest: Option<PathBuf>, password: Option<String>) -> Result<()> {
    let passphrase = resolve_password(password)?;
    let dest = dest.unwrap_or_else(|| PathBuf::from("."));
    let cfg = EngineConfig::new(dest.clone(), dest);
    let store = MetadataStore::open(&cfg, &passphrase)?;

    for run in store.list_backup_history(limit)? {
        println!(
            "#{:<5} {:<9} {:<12} files={:<5} errors={:<4} root={} dest={}",
            run.id,
            run.status,
            run.backup_type.as_deref().unwrap_or("-"),
            run.files_processed,
            run.errors,
            run.root_path,
            run.dest_path,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_cmd::Command;
    use predicates::prelude::*;

    #[test]
    fn scan_without_password_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        let dest = dir.path().join("dst");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&dest).unwrap();

        Command::cargo_bin("keeply")
            .unwrap()
            .args(["scan", "--root", root.to_str().unwrap(), "--dest", dest.to_str().unwrap()])
            .env_remove("KEEPLY_PASSWORD")
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("password is required"));
    }

    #[test]
    fn missing_required_flag_is_usage_error() {
        Command::cargo_bin("keeply").unwrap().args(["scan", "--root", "."]).assert().failure().code(2);
    }
}
