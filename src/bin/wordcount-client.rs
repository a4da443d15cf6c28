use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use relaylb::client::{self, LatencyLog, MockOptions, MOCK_KEYWORDS};
use relaylb::wordcount::WordCountError;
use tracing_subscriber::EnvFilter;

/// Query the word-count service
#[derive(Debug, Parser)]
#[command(name = "wordcount-client")]
struct Args {
    /// Run a mock client that repeatedly does random requests
    #[arg(long)]
    mock: bool,

    /// Get a list of documents
    #[arg(short = 'l', long)]
    list_docs: bool,

    /// ID of the document to search
    #[arg(short = 'd', long)]
    document: Option<String>,

    /// Keyword to search for
    #[arg(short = 'k', long)]
    keyword: Option<String>,

    /// Append per-request latencies to this file in mock mode
    #[arg(long, env = "LATENCY_FILE")]
    latency_file: Option<String>,

    #[arg(long, env = "RPYC_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "RPYC_PORT", default_value_t = 18861)]
    port: u16,

    /// Delay between mock requests, in milliseconds
    #[arg(long, env = "MOCK_SEND_INTERVAL", default_value_t = 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    if args.list_docs {
        return match client::list_docs(&addr).await {
            Ok(docs) => {
                println!("Available documents:");
                for doc in docs {
                    println!("{doc}");
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("Couldn't connect to server: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if args.mock {
        println!("Running mock");

        let latency_log = match &args.latency_file {
            Some(path) => match LatencyLog::open(path).await {
                Ok(log) => Some(log),
                Err(e) => {
                    println!("Couldn't open latency file {path}: {e}");
                    return ExitCode::FAILURE;
                }
            },
            None => None,
        };

        let options = MockOptions {
            interval: Duration::from_millis(args.interval_ms),
            keywords: MOCK_KEYWORDS,
            latency_log: latency_log.as_ref(),
            iterations: None,
        };

        return match client::mock_loop(&addr, options).await {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                println!("Couldn't connect to server: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let Some(doc) = args.document else {
        println!("No document specified");
        return ExitCode::FAILURE;
    };
    let Some(keyword) = args.keyword else {
        println!("No keyword specified");
        return ExitCode::FAILURE;
    };

    match client::timed_query(&addr, &doc, &keyword).await {
        Ok((response, _)) => {
            println!("{}", client::format_count(&response));
            ExitCode::SUCCESS
        }
        Err(WordCountError::Io(e)) => {
            println!("Couldn't connect to server: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            println!("Request failed: {e}");
            ExitCode::FAILURE
        }
    }
}
