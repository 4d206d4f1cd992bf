use std::process;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use volley::{Method, MultiDriver, PoolConfig, Request, Session, ThreadPool, api};

struct Args {
    method: Method,
    use_pool: bool,
    threads: Option<usize>,
    urls: Vec<String>,
}

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: volley-fetch [--method <M>] [--async] [--threads <N>] <URL>...");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --method <M>     GET, POST, PUT, DELETE, PATCH, HEAD or OPTIONS [default: GET]");
            eprintln!("  --async          Run each URL as a pool task instead of one multiplexed batch");
            eprintln!("  --threads <N>    Maximum pool threads with --async");
            process::exit(2);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("VOLLEY_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("volley={level},volley_fetch={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut method = Method::Get;
    let mut use_pool = false;
    let mut threads = None;
    let mut urls = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--method" => {
                i += 1;
                let value = args.get(i).ok_or("--method requires a value")?;
                method = value.parse().map_err(|e: volley::Error| e.to_string())?;
                if method.is_download() {
                    return Err("DOWNLOAD is not supported by volley-fetch".to_string());
                }
            }
            "--async" => use_pool = true,
            "--threads" => {
                i += 1;
                let value = args.get(i).ok_or("--threads requires a value")?;
                threads = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| format!("invalid thread count '{value}'"))?,
                );
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => urls.push(arg.to_string()),
        }
        i += 1;
    }

    if urls.is_empty() {
        return Err("at least one URL is required".to_string());
    }
    Ok(Args {
        method,
        use_pool,
        threads,
        urls,
    })
}

fn run(args: Args) -> anyhow::Result<()> {
    let responses = if args.use_pool {
        let config = match args.threads {
            Some(n) => PoolConfig::new(1, n),
            None => PoolConfig::default(),
        };
        let pool = ThreadPool::started(config).context("failed to start thread pool")?;
        let requests = args.urls.iter().map(Request::new).collect();
        let mut responses = Vec::new();
        for mut handle in api::multi_async(&pool, args.method, requests) {
            responses.push(handle.get()?);
        }
        responses
    } else {
        let mut driver = MultiDriver::new();
        for url in &args.urls {
            driver.add_session_with(
                Session::from_request(Request::new(url)).shared(),
                args.method,
            );
        }
        driver.perform()?
    };

    let mut failures = 0;
    for response in &responses {
        if !response.error.is_ok() {
            failures += 1;
            tracing::warn!(url = %response.url, code = ?response.error.code, "Transfer failed");
        }
        println!("{}", serde_json::to_string(response)?);
    }
    if failures == responses.len() {
        bail!("all {failures} transfers failed");
    }
    Ok(())
}
