//! Reference command-line tool: create, inspect, checkpoint and compact
//! database files.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use galdrdb::{Db, DbOptions, EncryptionOptions, GaldrError};

#[derive(Parser)]
#[command(name = "galdrdb", about = "GaldrDb database tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty database file.
    Create {
        path: PathBuf,
        #[arg(long)]
        page_size: Option<u32>,
        /// Disable the write-ahead log.
        #[arg(long)]
        no_wal: bool,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        kdf_iterations: Option<u32>,
    },
    /// Open a database and verify it is readable.
    Open {
        path: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
    /// Print collections, document counts and indexes.
    Info {
        path: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
    /// Fold the WAL into the main file and truncate it.
    Checkpoint {
        path: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
    /// Rewrite all live documents into a fresh file.
    Compact {
        path: PathBuf,
        target: PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
}

fn options_for(
    page_size: Option<u32>,
    no_wal: bool,
    password: Option<String>,
    kdf_iterations: Option<u32>,
) -> DbOptions {
    let mut options = DbOptions::default();
    if let Some(page_size) = page_size {
        options = options.page_size(page_size);
    }
    options = options.use_wal(!no_wal);
    if let Some(password) = password {
        let mut enc = EncryptionOptions::new(password);
        if let Some(iterations) = kdf_iterations {
            enc = enc.kdf_iterations(iterations);
        }
        options = options.encryption(enc);
    }
    options
}

fn open_options(password: Option<String>) -> DbOptions {
    match password {
        Some(password) => DbOptions::default().password(password),
        None => DbOptions::default(),
    }
}

fn prompt_password(password: Option<String>) -> Option<String> {
    // An empty --password means "prompt".
    match password {
        Some(p) if p.is_empty() => rpassword::read_password_from_tty(Some("Password: ")).ok(),
        other => other,
    }
}

fn run(cli: Cli) -> galdrdb::Result<()> {
    match cli.command {
        Command::Create {
            path,
            page_size,
            no_wal,
            password,
            kdf_iterations,
        } => {
            let password = prompt_password(password);
            let db = Db::create(&path, options_for(page_size, no_wal, password, kdf_iterations))?;
            drop(db);
            println!("created {}", path.display());
            Ok(())
        }
        Command::Open { path, password } => {
            let password = prompt_password(password);
            let db = Db::open(&path, open_options(password))?;
            println!(
                "opened {} ({} collections)",
                path.display(),
                db.collection_names().len()
            );
            Ok(())
        }
        Command::Info { path, password } => {
            let password = prompt_password(password);
            let db = Db::open(&path, open_options(password))?;
            let names = db.collection_names();
            println!("{}: {} collection(s)", path.display(), names.len());
            for name in names {
                if let Some(info) = db.get_collection_info(&name)? {
                    println!(
                        "  {}: {} document(s), next id {}",
                        info.name, info.document_count, info.next_id
                    );
                    for index in info.indexes {
                        println!(
                            "    index {} on ({}){}",
                            index.name,
                            index.fields.join(", "),
                            if index.unique { " unique" } else { "" }
                        );
                    }
                }
            }
            Ok(())
        }
        Command::Checkpoint { path, password } => {
            let password = prompt_password(password);
            let db = Db::open(&path, open_options(password))?;
            let pages = db.checkpoint()?;
            println!("checkpoint wrote {} page(s)", pages);
            Ok(())
        }
        Command::Compact { path, target, password } => {
            let password = prompt_password(password);
            let db = Db::open(&path, open_options(password))?;
            let result = db.compact_to(&target)?;
            println!(
                "compacted {} collection(s), {} document(s), target {} bytes ({} saved)",
                result.collections,
                result.documents_copied,
                result.target_file_size,
                result.bytes_saved
            );
            Ok(())
        }
    }
}

fn exit_code(error: &GaldrError) -> i32 {
    match error {
        GaldrError::InvalidArgument(_) | GaldrError::TransactionEnded => 2,
        GaldrError::Io(_) | GaldrError::Lock(_) => 3,
        GaldrError::Corruption(_)
        | GaldrError::Wal(_)
        | GaldrError::Encryption(_)
        | GaldrError::Poisoned(_) => 4,
        GaldrError::InvalidPassword => 5,
        GaldrError::WriteConflict { .. } | GaldrError::UniqueViolation { .. } => 2,
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("error: {}", error);
        process::exit(exit_code(&error));
    }
}
