//! Mercury CLI
//!
//! Drives a request through the full scheduler and async bridge path, the
//! same way script-initiated `fetch` runs.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use mercury::{AbortSignal, Headers, RequestInit, Response, RuntimeConfig, TaskScheduler, Value, Window, VERSION};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mercury")]
#[command(author, version, about = "Scripting-runtime core of a browser engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL and print status, headers and body
    Fetch {
        /// The URL to fetch
        url: String,

        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Extra request header, as `Name: value` (repeatable)
        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,

        /// Abort the request after this many milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Fetch {
            url,
            method,
            headers,
            data,
            timeout_ms,
        } => run_fetch(&url, &method, &headers, data, timeout_ms),
        Commands::Config => show_config(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("mercury={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `mercury::Error` can carry script values, which are not `Send`
fn host_error(err: mercury::Error) -> anyhow::Error {
    anyhow!("{}", err)
}

fn show_config() -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env().map_err(host_error)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("header '{}' is not of the form 'Name: value'", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

type Outcome = Result<(Rc<Response>, Vec<u8>), Value>;

fn run_fetch(url: &str, method: &str, headers: &[String], data: Option<String>, timeout_ms: Option<u64>) -> anyhow::Result<()> {
    let config = RuntimeConfig::from_env().map_err(host_error)?;
    let sched = TaskScheduler::new(config.scheduler.clone());
    let window = Window::new(sched.clone(), config).map_err(host_error)?;

    let pairs = headers.iter().map(|h| parse_header(h)).collect::<anyhow::Result<Vec<_>>>()?;
    let init = RequestInit {
        method: Some(method.to_string()),
        headers: Some(Headers::from_pairs(pairs).map_err(host_error)?),
        body: data.map(String::into_bytes),
        redirect: None,
        signal: timeout_ms.map(|ms| AbortSignal::timeout(&sched, ms as f64)),
    };

    let started = Instant::now();
    let outcome: Rc<RefCell<Option<Outcome>>> = Rc::new(RefCell::new(None));
    let sink = outcome.clone();
    window.fetch(url, init).on_settled(&sched, move |_, settlement| {
        let result = match settlement {
            Ok(value) => match value.host_data::<Response>() {
                Some(response) => match response.consume_body() {
                    Ok(body) => Ok((response, body)),
                    Err(err) => Err(err.to_value()),
                },
                None => Err(Value::from("fetch resolved with a non-Response value")),
            },
            Err(reason) => Err(reason),
        };
        *sink.borrow_mut() = Some(result);
        Ok(())
    });

    sched
        .run_until(|| outcome.borrow().is_some())
        .map_err(host_error)
        .context("event loop stopped before the fetch settled")?;
    window.close();

    let result = outcome.borrow_mut().take();
    match result {
        Some(Ok((response, body))) => {
            println!("{} {}", response.status(), response.status_text());
            for (name, value) in response.headers().borrow().iter() {
                println!("{}: {}", name, value);
            }
            println!();
            println!("{}", String::from_utf8_lossy(&body));
            tracing::info!(
                version = VERSION,
                elapsed_ms = started.elapsed().as_millis() as u64,
                bytes = body.len(),
                "fetch complete"
            );
            Ok(())
        }
        Some(Err(reason)) => bail!("fetch failed: {}", reason),
        None => bail!("fetch never settled"),
    }
}
