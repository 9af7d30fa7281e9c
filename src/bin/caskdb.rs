//! The caskdb REPL: a line-oriented shell over an embedded database. Lines
//! of the form `set <key> <value...>`, `get <key>`, and `delete <key>` are
//! executed against the database; parse errors are printed and the loop
//! continues.

#![warn(clippy::all)]

use caskdb::command::Command;
use caskdb::error::Result;
use caskdb::{Config, Database};

use clap::Parser;
use rustyline::error::ReadlineError;

#[derive(Parser)]
#[command(about = "An embedded Bitcask-style key-value store.", version)]
struct Args {
    /// Path to the database folder.
    folder: std::path::PathBuf,

    /// Configuration file path.
    #[arg(short = 'c', long, default_value = "caskdb.toml")]
    config: String,

    /// Log level: error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = args.log_level.parse()?;
    simplelog::SimpleLogger::init(level, simplelog::Config::default())?;

    let config = Config::load(&args.config)?;
    let db = Database::open(&args.folder, config)?;

    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        let line = match editor.readline("caskdb> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        editor.add_history_entry(&line)?;
        execute(&db, &line);
    }
    db.close()
}

/// Executes a single command line, printing the outcome to standard output.
fn execute(db: &Database, line: &str) {
    let command = match line.parse::<Command>() {
        Ok(command) => command,
        Err(err) => {
            println!("{err}");
            return;
        }
    };
    let result = match command {
        Command::Get { key } => match db.get(key.as_bytes()) {
            Ok(Some(value)) => {
                println!("{}", String::from_utf8_lossy(&value));
                Ok(())
            }
            Ok(None) => {
                println!("Key `{key}` not found");
                Ok(())
            }
            Err(err) => Err(err),
        },
        Command::Set { key, value } => db.set(key.as_bytes(), value.as_bytes()),
        Command::Delete { key } => db.delete(key.as_bytes()),
    };
    if let Err(err) = result {
        println!("{err}");
    }
}
