use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use pvpool::{Backpressure, Pv, PvError, PvPool, SubscriptionError};
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

#[derive(Parser)]
#[clap(about = "Read and monitor PVs through a PV pool")]
struct Options {
    /// Type for names without a 'type://' prefix
    #[clap(long, short = 't')]
    default_type: Option<String>,
    /// Write 'NAME=VALUE' before running the command. May be repeated.
    #[clap(long = "write", short = 'w', value_name = "NAME=VALUE")]
    writes: Vec<String>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current value of each PV
    Get {
        #[clap(required = true, id = "PV_NAME")]
        names: Vec<String>,
    },
    /// Print every update of the PVs
    Monitor {
        #[clap(required = true, id = "PV_NAME")]
        names: Vec<String>,
        /// Stop after this many updates
        #[clap(long, short = 'n')]
        count: Option<usize>,
        /// Stop after this many seconds
        #[clap(long)]
        timeout: Option<f64>,
    },
    /// List the PV types that the pool supports
    Types,
}

fn write_assignment(pool: &PvPool, assignment: &str) -> Result<(), PvError> {
    let Some((name, value)) = assignment.split_once('=') else {
        return Err(PvError::InvalidValue(format!(
            "Expected NAME=VALUE, got '{assignment}'"
        )));
    };
    // Not released, so that local PVs live on for the command that follows
    pool.get_pv(name.trim())?.write(value.trim())
}

fn get_all(pool: &PvPool, names: &[String]) -> Result<Vec<Arc<Pv>>, PvError> {
    let mut pvs = Vec::with_capacity(names.len());
    for name in names {
        match pool.get_pv(name) {
            Ok(pv) => pvs.push(pv),
            Err(e) => {
                for pv in &pvs {
                    pool.release_pv(pv);
                }
                return Err(e);
            }
        }
    }
    Ok(pvs)
}

fn monitor_limit(seconds: f64) -> Result<Duration, PvError> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| PvError::InvalidValue(format!("Invalid timeout '{seconds}' seconds")))
}

async fn monitor(pvs: &[Arc<Pv>], count: Option<usize>) {
    let mut streams = StreamMap::new();
    for pv in pvs {
        streams.insert(
            pv.name().to_owned(),
            pv.on_value_event(Backpressure::buffered()).into_stream(),
        );
    }
    let mut seen = 0usize;
    while let Some((name, update)) = streams.next().await {
        match update {
            Ok(value) => println!("{name} {value}"),
            Err(SubscriptionError::Disconnected(_)) => println!("{name} *** disconnected"),
            Err(e) => {
                debug!("Monitor of {name} ended: {e}");
                continue;
            }
        }
        seen += 1;
        if count.is_some_and(|count| seen >= count) {
            break;
        }
    }
}

async fn run(opts: Options) -> Result<(), PvError> {
    let mut builder = PvPool::builder();
    if let Some(default_type) = &opts.default_type {
        builder = builder.default_type(default_type);
    }
    let pool = builder.build();
    for assignment in &opts.writes {
        write_assignment(&pool, assignment)?;
    }

    match opts.command {
        Command::Types => {
            for prefix in pool.supported_prefixes() {
                let marker = if prefix == pool.default_type() { " (default)" } else { "" };
                println!("{prefix}{marker}");
            }
        }
        Command::Get { names } => {
            let pvs = get_all(&pool, &names)?;
            for pv in &pvs {
                match pv.async_read().await? {
                    Some(value) => println!("{} {value}", pv.name()),
                    None => println!("{} (no value)", pv.name()),
                }
                pool.release_pv(pv);
            }
        }
        Command::Monitor {
            names,
            count,
            timeout,
        } => {
            let limit = timeout.map(monitor_limit).transpose()?;
            let pvs = get_all(&pool, &names)?;
            match limit {
                Some(limit) => {
                    if tokio::time::timeout(limit, monitor(&pvs, count)).await.is_err() {
                        debug!("Monitor timed out after {limit:?}");
                    }
                }
                None => monitor(&pvs, count).await,
            }
            for pv in &pvs {
                pool.release_pv(pv);
            }
        }
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() -> ExitCode {
    let opts = Options::parse();

    let filter = EnvFilter::default()
        .add_directive(
            match opts.verbose {
                0 => LevelFilter::WARN,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .add_directive("tokio=off".parse().expect("Static directive is valid"))
        .add_directive("runtime=off".parse().expect("Static directive is valid"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_filter(filter);
    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_limits() {
        assert_eq!(monitor_limit(1.5).unwrap(), Duration::from_millis(1500));
        assert_eq!(monitor_limit(0.0).unwrap(), Duration::ZERO);
        for bad in [f64::INFINITY, f64::NAN, 1e20, -1.0] {
            assert!(monitor_limit(bad).is_err(), "{bad}");
        }
    }
}
