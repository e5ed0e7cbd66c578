// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs SQL paragraphs from the command line.
//!
//! Each positional argument is one paragraph, optionally starting with a
//! `(datasource)` selector. With no arguments a single paragraph is read from
//! standard input. Paragraphs run concurrently; their results are printed in
//! the order given. Interrupting the process cancels whatever is running.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hql_conn_pool::{ConnectionPool, DriverRegistry, PoolMetrics};
use hql_datasource::{CredentialPolicy, DatasourceRegistry};
use hql_interpreter::{ParagraphContext, ParallelScheduler, SqlInterpreter};
use hql_postgres_driver::PostgresDriver;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use crate::config::{ConfigDump, KeyValueArg, load_properties};

#[derive(Debug, Parser)]
#[clap(name = "hql-run", next_line_help = true)]
struct Args {
    /// Paragraphs to run. Reads one paragraph from stdin when omitted.
    paragraphs: Vec<String>,
    /// Properties file describing the datasources.
    #[clap(long, env = "HQL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Overrides a single property, e.g. `common.max_count=100`.
    #[clap(long = "property", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
    properties: Vec<KeyValueArg<String, String>>,
    /// The user paragraphs run as.
    #[clap(long, env = "HQL_USER", default_value = "anonymous")]
    user: String,
    /// Which log messages to emit, in `tracing_subscriber` filter syntax.
    #[clap(long, env = "HQL_LOG_FILTER", default_value = "info")]
    log_filter: String,
    /// PEM root certificate used to verify servers with `sslmode=require`.
    #[clap(long, value_name = "PATH")]
    tls_root_cert: Option<PathBuf>,
    /// Maximum number of paragraphs running at once.
    #[clap(long, default_value_t = ParallelScheduler::DEFAULT_SLOTS)]
    slots: usize,
    /// Print the effective configuration as JSON and exit.
    #[clap(long)]
    dump_config: bool,
    /// Print connection pool metrics to stderr before exiting.
    #[clap(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_filter))
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("hql-run: fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Runs the paragraphs, returning whether all of them succeeded.
async fn run(args: Args) -> Result<bool, anyhow::Error> {
    let properties = load_properties(args.config.as_deref(), &args.properties)?;
    let datasources = DatasourceRegistry::from_properties(&properties);

    let mut driver = PostgresDriver::new();
    if let Some(path) = &args.tls_root_cert {
        let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        driver = driver.with_root_cert(pem);
    }
    let mut drivers = DriverRegistry::new();
    driver.register(&mut drivers);

    if args.dump_config {
        let dump = ConfigDump::new(&datasources, drivers.identifiers().collect());
        println!("{}", serde_json::to_string_pretty(&dump)?);
        return Ok(true);
    }

    let paragraphs = if args.paragraphs.is_empty() {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading paragraph from stdin")?;
        vec![text]
    } else {
        args.paragraphs
    };

    let registry = Registry::new();
    let metrics = PoolMetrics::register_into(&registry).context("registering metrics")?;
    let pool = ConnectionPool::new(Arc::new(datasources), drivers, CredentialPolicy::default())
        .with_metrics(metrics);
    let interpreter = Arc::new(
        SqlInterpreter::new(pool)
            .with_scheduler(ParallelScheduler::new("hql-run", args.slots)),
    );

    let contexts: Vec<_> = (1..=paragraphs.len())
        .map(|i| ParagraphContext::new(args.user.as_str(), format!("paragraph-{i}")))
        .collect();
    let handles: Vec<_> = paragraphs
        .into_iter()
        .zip(contexts.iter().cloned())
        .map(|(text, ctx)| interpreter.submit(text, ctx))
        .collect();

    let canceller = {
        let interpreter = Arc::clone(&interpreter);
        let contexts = contexts.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling running paragraphs");
                for ctx in &contexts {
                    interpreter.cancel(ctx).await;
                }
            }
        })
    };

    let mut all_succeeded = true;
    for (ctx, result) in contexts.iter().zip(futures::future::join_all(handles).await) {
        let result = result.context("paragraph task failed")?;
        if result.is_success() {
            print!("{}", result.message());
        } else {
            all_succeeded = false;
            eprintln!("{}: {}", ctx.paragraph_id, result.message());
        }
    }
    canceller.abort();

    interpreter.close().await;
    info!("done");

    if args.print_metrics {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .context("encoding metrics")?;
        eprint!("{}", String::from_utf8_lossy(&buf));
    }
    Ok(all_succeeded)
}
