/**
 * tenant-sync
 *
 * Inspects and maintains the local write buffer without signing in:
 *
 *   tenant-sync [--config <file>] status
 *   tenant-sync [--config <file>] dead-letters
 *   tenant-sync [--config <file>] purge-dead-letters <days>
 */

#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Debug)]
enum Command {
    Status,
    DeadLetters,
    PurgeDeadLetters(i64),
}

#[cfg(feature = "cli")]
fn parse_args(args: &[String]) -> Result<(Option<PathBuf>, Command), String> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().ok_or("--config needs a path")?;
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        ["status"] | [] => Command::Status,
        ["dead-letters"] => Command::DeadLetters,
        ["purge-dead-letters", days] => {
            let days = days
                .parse::<i64>()
                .map_err(|_| format!("invalid number of days: {}", days))?;
            if days < 0 {
                return Err("days must not be negative".to_string());
            }
            Command::PurgeDeadLetters(days)
        }
        other => return Err(format!("unknown command: {}", other.join(" "))),
    };
    Ok((config, command))
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use tenantlink::local_db::LocalDatabase;
    use tenantlink::offline::LocalWriteBuffer;
    use tenantlink::shared::LayerConfig;

    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("Usage: tenant-sync [--config <file>] <status|dead-letters|purge-dead-letters <days>>");
            std::process::exit(2);
        }
    };

    let config = LayerConfig::load(config_path.as_deref())?;
    tracing::info!("[CLI] Using local database {}", config.local_db_path.display());
    let database = LocalDatabase::open(&config.local_db_path).await?;

    match command {
        Command::Status => {
            let stats = database.stats().await?;
            println!("pending writes:    {}", stats.pending_writes);
            println!("in-flight writes:  {}", stats.in_flight_writes);
            println!("dead letters:      {}", stats.dead_letters);
            println!("cached records:    {}", stats.cached_records);
            println!("sync cursors:      {}", stats.sync_cursors);
        }
        Command::DeadLetters => {
            let buffer = LocalWriteBuffer::open(database.clone()).await?;
            let dead_letters = buffer.dead_letters(None).await?;
            if dead_letters.is_empty() {
                println!("no dead letters");
            }
            for letter in dead_letters {
                println!(
                    "{}  {}  {}/{}  {:?}  {} ({}) after {} attempts",
                    letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    letter.tenant_id,
                    letter.collection,
                    letter.record_id,
                    letter.op,
                    letter.reason,
                    letter.failure_class.as_str(),
                    letter.attempts,
                );
            }
        }
        Command::PurgeDeadLetters(days) => {
            let stats = database.cleanup(days).await?;
            println!("removed {} dead letters older than {} days", stats.dead_letters_removed, days);
        }
    }

    database.close().await;
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("tenant-sync requires the 'cli' feature to be enabled.");
    eprintln!("Run with: cargo run --bin tenant-sync --features cli");
    std::process::exit(1);
}
