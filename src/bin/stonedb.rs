use std::io::BufRead;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use stonedb::{backup, Database};

#[derive(Parser)]
#[command(
    name = "stonedb",
    about = "StoneDB - embedded transactional key-value store",
    version
)]
struct Cli {
    /// Path to the database file
    #[arg(long, default_value = "stonedb.sdb")]
    db: PathBuf,

    /// Read commands from stdin without a prompt
    #[arg(long)]
    batch: bool,

    /// Suppress log output
    #[arg(long)]
    quiet: bool,
}

fn print_help() {
    println!("Commands:");
    println!("  put <key> <value>   - Store key-value pair");
    println!("  get <key>           - Retrieve value for key");
    println!("  del <key>           - Delete key");
    println!("  scan                - Show all records");
    println!("  backup <path>       - Write all records to a JSON file");
    println!("  restore <path>      - Load records from a JSON file");
    println!("  stats               - Show engine statistics");
    println!("  help                - Show this help");
    println!("  quit                - Exit database");
}

fn cmd_put(db: &Database, key: &str, value: &str) {
    let txn = match db.begin() {
        Ok(txn) => txn,
        Err(e) => {
            println!("ERROR: {}", e);
            return;
        }
    };
    match db
        .put(txn, key.as_bytes(), value.as_bytes())
        .and_then(|()| db.commit(txn))
    {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("ERROR: {}", e);
            let _ = db.abort(txn);
        }
    }
}

fn cmd_get(db: &Database, key: &str) {
    let txn = match db.begin() {
        Ok(txn) => txn,
        Err(e) => {
            println!("ERROR: {}", e);
            return;
        }
    };
    match db.get(txn, key.as_bytes()) {
        Ok(Some(value)) => {
            println!("{}", String::from_utf8_lossy(&value));
            let _ = db.commit(txn);
        }
        Ok(None) => {
            println!("NOT FOUND");
            let _ = db.commit(txn);
        }
        Err(e) => {
            println!("ERROR: {}", e);
            let _ = db.abort(txn);
        }
    }
}

fn cmd_del(db: &Database, key: &str) {
    let txn = match db.begin() {
        Ok(txn) => txn,
        Err(e) => {
            println!("ERROR: {}", e);
            return;
        }
    };
    match db.delete(txn, key.as_bytes()) {
        Ok(found) => match db.commit(txn) {
            Ok(()) => println!("{}", if found { "OK" } else { "NOT FOUND" }),
            Err(e) => println!("ERROR: {}", e),
        },
        Err(e) => {
            println!("ERROR: {}", e);
            let _ = db.abort(txn);
        }
    }
}

fn cmd_scan(db: &Database) {
    match db.scan() {
        Ok(records) if records.is_empty() => println!("No records found"),
        Ok(records) => {
            for (key, value) in records {
                println!(
                    "{} = {}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
            }
        }
        Err(e) => println!("ERROR: {}", e),
    }
}

/// Run one command line. Returns `false` when the shell should exit.
fn execute_line(db: &Database, line: &str) -> bool {
    let trimmed = line.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match cmd {
        "" => {}
        "quit" | "exit" => return false,
        "help" => print_help(),
        "put" => {
            let mut kv = rest.splitn(2, char::is_whitespace);
            match (kv.next().filter(|k| !k.is_empty()), kv.next()) {
                (Some(key), Some(value)) => cmd_put(db, key, value.trim()),
                _ => println!("Usage: put <key> <value>"),
            }
        }
        "get" => {
            if rest.is_empty() {
                println!("Usage: get <key>");
            } else {
                cmd_get(db, rest);
            }
        }
        "del" => {
            if rest.is_empty() {
                println!("Usage: del <key>");
            } else {
                cmd_del(db, rest);
            }
        }
        "scan" => cmd_scan(db),
        "backup" => {
            if rest.is_empty() {
                println!("Usage: backup <path>");
            } else {
                match backup::backup(db, &PathBuf::from(rest)) {
                    Ok(count) => println!("OK ({} records)", count),
                    Err(e) => println!("ERROR: {}", e),
                }
            }
        }
        "restore" => {
            if rest.is_empty() {
                println!("Usage: restore <path>");
            } else {
                match backup::restore(db, &PathBuf::from(rest)) {
                    Ok(count) => println!("OK ({} records)", count),
                    Err(e) => println!("ERROR: {}", e),
                }
            }
        }
        "stats" => println!("{}", db.stats()),
        other => {
            println!("Unknown command: {}", other);
            println!("Type 'help' for available commands");
        }
    }
    true
}

fn run_batch(db: &Database) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) => {
                if !execute_line(db, &line) {
                    break;
                }
            }
            Err(e) => {
                eprintln!("ERROR: {}", e);
                break;
            }
        }
    }
}

fn run_repl(db: &Database) {
    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("ERROR: failed to initialize prompt: {}", e);
            process::exit(1);
        }
    };

    println!("StoneDB v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'help' for commands");

    loop {
        match rl.readline("stonedb> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    let _ = rl.add_history_entry(trimmed);
                }
                if !execute_line(db, trimmed) {
                    break;
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                // Ctrl-C: drop the current line, keep the shell.
                println!();
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("ERROR: {}", e);
                break;
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    );
    if cli.quiet {
        logger.filter_level(log::LevelFilter::Off);
    }
    logger.init();

    let mut db = Database::open(&cli.db).unwrap_or_else(|e| {
        eprintln!("ERROR: failed to open database: {}", e);
        process::exit(1);
    });

    if cli.batch {
        run_batch(&db);
    } else {
        run_repl(&db);
        println!("Goodbye!");
    }

    if let Err(e) = db.close() {
        eprintln!("ERROR: failed to close database: {}", e);
        process::exit(1);
    }
}
