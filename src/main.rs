//! h2probe command line
//!
//! Probes one target through an HTTP CONNECT proxy (or directly with
//! `--no-proxy`) and prints every phase as it is reached, then the
//! response and the load metrics.

use clap::Parser;
use h2probe::config::{Endpoint, ProbeConfig, DEFAULT_PROXY, DEFAULT_TARGET, DEFAULT_USER_AGENT};
use h2probe::{ProbeFailure, ProbeReport, Transition, TunnelProbe};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Probe a website over HTTP/2 through an HTTP CONNECT proxy
#[derive(Parser, Debug)]
#[command(name = "h2probe")]
#[command(version)]
struct Args {
    /// Proxy address (host:port)
    #[arg(long, default_value = DEFAULT_PROXY)]
    proxy: Endpoint,

    /// Target address (host:port)
    #[arg(long, default_value = DEFAULT_TARGET)]
    target: Endpoint,

    /// Connect to the target directly, skipping the proxy
    #[arg(long)]
    no_proxy: bool,

    /// Do not verify the target certificate
    #[arg(short = 'k', long)]
    insecure: bool,

    /// PEM file with additional trust anchors
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Also offer http/1.1 through ALPN
    #[arg(long)]
    alpn_fallback: bool,

    /// Request path
    #[arg(long, default_value = "/")]
    path: String,

    /// user-agent request header
    #[arg(long, default_value = DEFAULT_USER_AGENT)]
    user_agent: String,

    /// TCP connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// CONNECT reply timeout in seconds
    #[arg(long, default_value_t = 10)]
    tunnel_timeout: u64,

    /// TLS handshake timeout in seconds
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,

    /// HTTP/2 request timeout in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// Log filter (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'v', long, default_value = "warn")]
    log_level: String,

    /// Characters of the body to print
    #[arg(long, default_value_t = 500)]
    preview: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ProbeConfig::builder()
        .proxy_endpoint(args.proxy.clone())
        .target_endpoint(args.target.clone())
        .use_proxy(!args.no_proxy)
        .tls_verify(!args.insecure)
        .alpn_fallback(args.alpn_fallback)
        .path(args.path.clone())
        .user_agent(args.user_agent.clone())
        .connect_timeout(Duration::from_secs(args.connect_timeout))
        .tunnel_timeout(Duration::from_secs(args.tunnel_timeout))
        .handshake_timeout(Duration::from_secs(args.handshake_timeout))
        .request_timeout(Duration::from_secs(args.request_timeout));
    let config = match args.ca_file.clone() {
        Some(path) => config.ca_file(path),
        None => config,
    };

    let config = match config.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[CONFIG] {}", e);
            return ExitCode::from(2);
        }
    };

    if config.use_proxy {
        println!("[PROBE] {} via proxy {}", config.target, config.proxy);
    } else {
        println!("[PROBE] {} (direct)", config.target);
    }

    let on_phase = |t: Transition| println!("[{}] +{} ms", t.phase, t.elapsed.as_millis());
    match TunnelProbe::new(config).run_observed(on_phase, |_| {}) {
        Ok(report) => {
            print_report(&report, args.preview);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            print_failure(&failure);
            if failure.error.is_config() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn print_report(report: &ProbeReport, preview: usize) {
    if let Some(tunnel) = &report.tunnel {
        println!("[TUNNEL] {}", tunnel.status_line());
    }

    let tls = &report.tls;
    println!(
        "[TLS] {} {} alpn={}",
        tls.version,
        tls.cipher,
        tls.alpn.as_deref().unwrap_or("-")
    );
    if let Some(cert) = tls.peer_cert() {
        let self_issued = if cert.is_self_issued() { " (self-issued)" } else { "" };
        println!("[TLS] peer {} issued by {}{}", cert.subject, cert.issuer, self_issued);
    }
    if let Some(err) = &tls.verify_error {
        println!("[TLS] verification: {}", err);
    }

    println!("[HTTP2] :status {}", report.status);
    for (name, value) in report.headers.iter() {
        println!("[HTTP2] {}: {}", name, value);
    }
    if let Some(trailers) = &report.trailers {
        for (name, value) in trailers.iter() {
            println!("[TRAILER] {}: {}", name, value);
        }
    }

    if preview > 0 && !report.body.is_empty() {
        println!("[BODY] first {} characters:", preview);
        println!("{}", report.body_preview(preview));
    }

    let m = &report.metrics;
    println!(
        "[DONE] {} bytes in {} ms (first byte after {} ms)",
        m.body_bytes,
        m.total.as_millis(),
        m.time_to_first_byte.as_millis()
    );
}

fn print_failure(failure: &ProbeFailure) {
    let error = &failure.error;
    println!("[ERROR] {} during {}: {}", error.kind(), error.phase(), error);
    if let Some(kind) = error.failure_kind() {
        println!("[ERROR] connection failure: {}", kind);
    }
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        println!("[ERROR] caused by: {}", cause);
        source = cause.source();
    }
    println!("[ERROR] last phase reached: {}", failure.last_phase);
}
