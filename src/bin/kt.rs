use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use tokio::task;

use kt::kafka::KafkaLog;
use kt::sink::LineSink;
use kt::{
    drain, plan_ranges, ConsumeConfig, EndPosition, FanInCoordinator, LogClient, LogReporter,
    OpenFailurePolicy, StartPosition,
};

#[derive(Parser)]
#[command(name = "kt", version, about = "kafka cli tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume a topic, printing one payload per line
    Consume(ConsumeArgs),
}

#[derive(Args, Debug)]
struct ConsumeArgs {
    /// The topic
    #[arg(short, long)]
    topic: String,

    /// The brokers to connect to (comma-separated)
    #[arg(short, long, value_delimiter = ',', required = true)]
    broker: Vec<String>,

    /// Offset to start consuming from: beginning | end | <value> | -<value>
    #[arg(short, long, default_value = "end", allow_hyphen_values = true)]
    offset: String,

    /// Consume a single partition
    #[arg(short, long)]
    partition: Option<i32>,

    /// Start consuming from the specified RFC3339 timestamp
    #[arg(long)]
    start_date: Option<String>,

    /// Stop consuming at the specified RFC3339 timestamp
    #[arg(long)]
    end_date: Option<String>,

    /// Stop consuming after n messages
    #[arg(short, long)]
    count: Option<u64>,

    /// Stop consuming after the last message present at startup
    #[arg(short, long)]
    exit: bool,

    /// Slots in the merged output queue
    #[arg(long, default_value_t = 1)]
    queue_capacity: usize,

    /// Keep consuming the other partitions when one fails to open
    #[arg(long)]
    skip_failed_partitions: bool,
}

impl ConsumeArgs {
    fn start(&self) -> Result<StartPosition> {
        match &self.start_date {
            Some(date) => Ok(StartPosition::from_rfc3339(date)?),
            None => Ok(self.offset.parse::<StartPosition>()?),
        }
    }

    fn end(&self) -> Result<Option<EndPosition>> {
        if let Some(date) = &self.end_date {
            return Ok(Some(EndPosition::from_rfc3339(date)?));
        }
        Ok(self.exit.then_some(EndPosition::Head))
    }

    fn config(&self) -> ConsumeConfig {
        ConsumeConfig {
            queue_capacity: self.queue_capacity,
            open_failure: if self.skip_failed_partitions {
                OpenFailurePolicy::Skip
            } else {
                OpenFailurePolicy::Abort
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Consume(args) => consume(args).await,
    }
}

async fn consume(args: ConsumeArgs) -> Result<()> {
    let start = args.start()?;
    let end = args.end()?;
    let brokers: Vec<String> = args
        .broker
        .iter()
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .collect();

    let client = Arc::new(KafkaLog::connect(&brokers).context("Could not connect to brokers")?);

    info!("Fetching offsets");
    let planner = Arc::clone(&client);
    let topic = args.topic.clone();
    let partition = args.partition;
    let ranges = task::spawn_blocking(move || {
        plan_ranges(planner.as_ref(), &topic, start, end, partition)
    })
    .await
    .context("Offset lookup task failed")??;

    let mut session = FanInCoordinator::new(client.clone())
        .with_config(args.config())
        .start(args.topic.clone(), ranges)
        .await
        .context("Could not start consumer")?;

    let shutdown = session.shutdown().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.trigger();
        }
    });

    let mut sink = LineSink::new(io::BufWriter::new(io::stdout()));
    let stats = drain(&mut session, args.count, &mut sink, &LogReporter).await?;
    let summary = session.finish().await?;
    info!(
        "Printed {} messages from {} partitions",
        stats.rendered,
        summary.partitions.len()
    );

    task::spawn_blocking(move || client.close())
        .await
        .context("Client close task failed")?
        .context("Could not properly close the client")?;
    info!("Connection closed. Bye.");
    Ok(())
}
