use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use deepstack_flow::{
    config::{ConfigManager, EnvConfigManager},
    deepstack::DeepStackClient,
    export::write_outputs,
    flow::Flow,
    logger::init_tracing,
    message::Message,
    node::{NodeContext, NodeInstance},
    outline::ImageOutliner,
    schema::write_schema,
    status::{StatusBoard, TracingHost},
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "deepstack-flow",
    about = "Route DeepStack object detections to labelled outputs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one image through a node of a flow
    Run(RunArgs),

    /// Check that a flow file parses
    Validate {
        /// Flow file (.yaml, .yml or .json)
        #[arg(long)]
        flow: PathBuf,
    },

    /// Emit JSON-Schema for flow files
    Schema {
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Flow file (.yaml, .yml or .json)
    #[arg(long)]
    flow: PathBuf,

    /// Id of the node to run
    #[arg(long)]
    node: String,

    /// Image to send
    #[arg(long)]
    image: PathBuf,

    /// Where the outputs are written
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// .env file with settings such as DEEPSTACK_API_KEY
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Outline stroke width in pixels
    #[arg(long, default_value_t = 3)]
    line_width: u32,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also log to this file, rotated daily
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Validate { flow } => {
            let flow = Flow::load(&flow)?;
            println!("✅ Flow file is valid ({} nodes).", flow.nodes.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schema { out_dir } => {
            let path = write_schema(&out_dir)?;
            println!("Schema written to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// The log file guards live until this returns, so every line is flushed
/// before the process exits.
async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let _guards = init_tracing(&args.log_level, args.log_file.as_deref())?;

    let flow = Flow::load(&args.flow)?;
    let Some(flow_node) = flow.node(&args.node) else {
        bail!("no node `{}` in {}", args.node, args.flow.display());
    };

    let config = ConfigManager(EnvConfigManager::new(args.env_file.clone()));
    let servers = Arc::new(flow.registry(&config).await);
    let context = NodeContext::new(
        servers,
        Arc::new(DeepStackClient::new()),
        Arc::new(ImageOutliner::new(args.line_width)),
    );
    let status = StatusBoard::new(Arc::new(TracingHost));
    let instance = NodeInstance::new(&flow_node.id, flow_node.node.clone(), context, status);

    let image = fs::read(&args.image)
        .with_context(|| format!("could not read image {}", args.image.display()))?;
    let msg = Message::from_image(image);
    info!("sending {} to node `{}`", args.image.display(), instance.id());

    match instance.on_input(msg).await {
        Some(outputs) => {
            let written = write_outputs(&outputs, &args.out_dir)?;
            for path in &written {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            error!("node `{}` produced no output", instance.id());
            Ok(ExitCode::FAILURE)
        }
    }
}
