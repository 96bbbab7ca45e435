/// gdbrelay - GDB/MI command relay
///
/// Spawns GDB through the session engine, relays commands typed on stdin as
/// synchronous requests and prints replies and notifications as JSON lines.
/// A line starting with `!` runs with the target stopped.

use clap::Parser;
use gdbclient::{GdbError, Notification, ProcessTransport, ResultRecord, Session, SessionConfig};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "gdbrelay")]
#[command(version = "0.1.0")]
#[command(about = "Relay GDB/MI commands from stdin and print the replies as JSON", long_about = None)]
struct Cli {
    /// JSON session configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// GDB executable
    #[arg(long)]
    gdb: Option<PathBuf>,

    /// Inactivity timeout for each command, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,

    /// Extra arguments passed to GDB
    #[arg(last = true)]
    gdb_args: Vec<String>,
}

const INTERRUPT_PREFIX: char = '!';

fn load_config(cli: &Cli) -> gdbclient::Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(gdb) = &cli.gdb {
        config.gdb_path = gdb.clone();
    }
    if let Some(timeout) = cli.timeout_ms {
        config.command_timeout_ms = timeout;
    }
    config.gdb_args.extend(cli.gdb_args.iter().cloned());
    config.validate()?;
    Ok(config)
}

fn print_record(record: &ResultRecord) {
    match serde_json::to_string(record) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize result: {}", e),
    }
}

fn print_notification(notification: &Notification) {
    match serde_json::to_string(notification) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize notification: {}", e),
    }
}

fn print_error(error: &GdbError) {
    println!("{}", serde_json::json!({ "error": error.to_string() }));
}

async fn relay(session: &Session, line: &str) -> gdbclient::Result<ResultRecord> {
    match line.strip_prefix(INTERRUPT_PREFIX) {
        Some(command) => {
            let command = command.trim().to_string();
            session
                .with_target_stopped(true, move |s| async move { s.send_command(&command).await })
                .await
        }
        None => session.send_command(line).await,
    }
}

async fn run(cli: Cli) -> gdbclient::Result<i32> {
    let config = load_config(&cli)?;
    let transport = ProcessTransport::new(&config);
    let session = Session::attach(transport, config)?;

    if let Some(mut notifications) = session.take_notifications() {
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                print_notification(&notification);
            }
        });
    }

    session.initialize().await?;
    log::info!("GDB session ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = session.closed() => {
                log::info!("GDB went away");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                break;
            }
        };
        let line = match line {
            Some(line) => line,
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match relay(&session, line).await {
            Ok(record) => print_record(&record),
            Err(GdbError::Exited) => {
                print_error(&GdbError::Exited);
                break;
            }
            Err(e) => {
                log::warn!("'{}' failed: {}", line, e);
                print_error(&e);
            }
        }
    }

    session.close();
    session.closed().await;
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(cli.log_level)
        .with_module_level("gdbclient", cli.log_level.max(log::LevelFilter::Info))
        .init()
    {
        eprintln!("Failed to initialize logger: {}", e);
    }

    log::info!("gdbrelay starting...");

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            1
        }
    };

    log::info!("gdbrelay exited with code: {exit_code}");
    std::process::exit(exit_code);
}
