use census::{
    conf::{load_dotenv, CensusConfig},
    kafka::{
        DiscoveryOutcome, MessageTotal, OffsetFetcher, PartitionDetail, PartitionDetailView,
        PartitionIndex, RdKafkaConnector, TopicDiscovery,
    },
    utils::o11y::logging::build_subscriber,
};

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result};
use tokio::sync::mpsc;

/// Report how many messages each topic of a Kafka cluster currently retains
#[derive(Parser)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Json)]
    format: Format,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every topic with its partition count and message total
    Topics,

    /// Show the highwater offset and message count of one partition
    Partition {
        /// Topic to inspect
        topic: String,

        /// Partition number
        #[arg(long, default_value_t = 0)]
        partition: PartitionIndex,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing::subscriber::set_global_default(build_subscriber()?)?;
    load_dotenv();

    let cli = Cli::parse();
    let config = CensusConfig::load(&cli.config)?;
    let fetcher = OffsetFetcher::new(
        Arc::new(RdKafkaConnector::new(config.kafka.request_timeout())),
        config.kafka.endpoint(),
    );

    match cli.command {
        Command::Topics => {
            let (sender, mut receiver) = mpsc::channel(1);
            let discovery = TopicDiscovery::from_config(fetcher, &config.discovery);
            tokio::spawn(async move { discovery.discover(sender).await });
            let outcome = receiver
                .recv()
                .await
                .ok_or_else(|| eyre!("discovery ended without a result"))?;
            print_outcome(&outcome, cli.format)?;
            if let DiscoveryOutcome::Failed(failure) = outcome {
                return Err(eyre!("discovery failed: {:?}", failure));
            }
        }
        Command::Partition { topic, partition } => {
            let (sender, mut receiver) = mpsc::channel(1);
            let view = PartitionDetailView::from_config(fetcher, &config.detail);
            tokio::spawn(async move { view.deliver(&topic, partition, sender).await });
            let detail = receiver
                .recv()
                .await
                .ok_or_else(|| eyre!("partition detail ended without a result"))??;
            print_detail(&detail, cli.format)?;
        }
    }
    Ok(())
}

fn print_outcome(outcome: &DiscoveryOutcome, format: Format) -> Result<()> {
    match (format, outcome) {
        (Format::Json, _) => println!("{}", serde_json::to_string_pretty(outcome)?),
        (Format::Text, DiscoveryOutcome::Ready(snapshot)) => {
            println!("{:<48} {:>10} {:>16}", "TOPIC", "PARTITIONS", "MESSAGES");
            for descriptor in &snapshot.topics {
                let messages = match &descriptor.messages {
                    MessageTotal::Resolved(total) => total.to_string(),
                    MessageTotal::Failed(_) => "error".to_string(),
                };
                println!(
                    "{:<48} {:>10} {:>16}",
                    descriptor.topic, descriptor.partition_count, messages
                );
            }
        }
        (Format::Text, DiscoveryOutcome::Failed(failure)) => println!("Error: {:?}", failure),
    }
    Ok(())
}

fn print_detail(detail: &PartitionDetail, format: Format) -> Result<()> {
    match (format, detail) {
        (Format::Json, _) => println!("{}", serde_json::to_string_pretty(detail)?),
        (Format::Text, PartitionDetail::Live(snapshot)) => {
            println!("highwater offset: {}", snapshot.highwater_offset);
            println!("message count:    {}", snapshot.message_count);
        }
        (Format::Text, PartitionDetail::Canned(partitions)) => {
            println!(
                "{:>9} {:<24} {:>14} {:>10}",
                "PARTITION", "BROKER", "CURRENT OFFSET", "MESSAGES"
            );
            for entry in partitions {
                println!(
                    "{:>9} {:<24} {:>14} {:>10}",
                    entry.partition, entry.broker, entry.current_offset, entry.msg_count
                );
            }
        }
    }
    Ok(())
}
