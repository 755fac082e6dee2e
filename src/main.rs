use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use render_farm::config::AppConfig;
use render_farm::farm::discovery::{self, DiscoveryOptions};
use render_farm::farm::protocol::{NodeInfo, StatusResponse};
use render_farm::farm::transfer::TransferStore;
use render_farm::farm::{run_server, AgentConfig, Backoff, FarmAgent, FarmClient, FarmRegistry, SubmitOptions};
use render_farm::render::{LayerComp, OutputFormat as RenderFormat, RenderSettings};
use render_farm::scheduler::{Job, JobId, JobStatus, NodeId, QueueManager, SnapshotStore};
use render_farm::shutdown::install_shutdown_handler;
use render_farm::worker::{CommandCompositor, RenderSupervisor};

#[derive(Parser, Debug)]
#[command(name = "render-farm")]
#[command(version)]
#[command(about = "Batch render queue and render farm for a command-line animation renderer")]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (defaults to config.json in the per-user config folder)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render project files now, without touching the saved queue
    Render {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Manage the saved local queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Run the farm master
    Master {
        /// Port to listen on (overrides the config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a render node that takes jobs from a farm master
    Slave {
        /// Master URL, e.g. http://10.0.0.5:5580
        #[arg(long)]
        master: Option<String>,

        /// Search the local network for a master
        #[arg(long, conflicts_with = "master")]
        discover: bool,

        /// Port advertised to the master
        #[arg(long, default_value = "0")]
        port: u16,
    },

    /// Talk to a farm master
    Farm {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: FarmCommands,
    },

    /// Search the local network for a farm master
    Discover {
        /// Subnet to scan in CIDR form (defaults to this machine's /24)
        #[arg(long)]
        subnet: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Add project files to the queue
    Add {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// List queued jobs
    List {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
    /// Render the queue until nothing is pending
    Run,
    /// Put a failed or cancelled job back in the queue
    Retry { job_id: JobId },
    /// Remove a job that is not rendering
    Remove { job_id: JobId },
    /// Write the queue to a file
    Export { path: PathBuf },
    /// Load jobs from an exported queue file
    Import {
        path: PathBuf,
        /// Keep the current jobs instead of replacing them
        #[arg(long)]
        append: bool,
    },
    /// Drop completed, failed and cancelled jobs
    Clear,
}

#[derive(Subcommand, Debug)]
enum FarmCommands {
    /// Submit project files to the farm
    Submit {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Upload the project instead of relying on shared storage
        #[arg(long)]
        bundle: bool,

        /// Only let this node render the jobs
        #[arg(long)]
        pin: Option<String>,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Show nodes and jobs
    Status,
    /// Show pending and active jobs
    Queue,
    /// Ask the rendering node to stop a job
    Cancel { job_id: JobId },
    /// Pin a pending job to a node, or unpin it
    Assign {
        job_id: JobId,
        node_id: Option<String>,
    },
    /// Put a failed or cancelled farm job back in the pool
    Retry { job_id: JobId },
    /// Remove a farm job that is not being rendered
    Remove { job_id: JobId },
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Master URL (defaults to farm.master_host and farm.port from the config)
    #[arg(long, short = 'm')]
    master: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

/// Render settings shared by every command that creates jobs.
#[derive(Args, Debug, Clone)]
struct SettingsArgs {
    /// Output format, e.g. MP4, PNG, "Animated GIF"
    #[arg(long, short = 'f', default_value = "MP4")]
    format: RenderFormat,

    /// Codec preset (defaults to the format's first preset)
    #[arg(long)]
    preset: Option<String>,

    /// Output folder (defaults to the project folder)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// One subfolder per project inside the output folder
    #[arg(long)]
    subfolder: bool,

    #[arg(long)]
    start: Option<u32>,

    #[arg(long)]
    end: Option<u32>,

    /// Layer comp name, or ALL / ALL_AND_MAIN
    #[arg(long)]
    layer_comp: Option<LayerComp>,

    /// 0 (minimum) to 5 (lossless)
    #[arg(long)]
    quality: Option<u8>,

    /// 24 or 32
    #[arg(long)]
    depth: Option<u8>,

    /// Codec index for movie formats, passed through to the renderer
    #[arg(long)]
    video_codec: Option<u32>,

    #[arg(long)]
    multithread: Option<bool>,
    #[arg(long)]
    half_size: Option<bool>,
    #[arg(long)]
    half_fps: Option<bool>,
    #[arg(long)]
    shape_fx: Option<bool>,
    #[arg(long)]
    layer_fx: Option<bool>,
    #[arg(long)]
    antialias: Option<bool>,

    /// Copy the project's Images folder next to it before rendering
    #[arg(long)]
    copy_images: bool,

    /// Composite the layer comps once the render is done
    #[arg(long)]
    compose: bool,

    #[arg(long, requires = "compose")]
    reverse_layers: bool,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl SettingsArgs {
    fn to_settings(&self) -> RenderSettings {
        let mut settings = RenderSettings::for_format(self.format);
        if self.preset.is_some() {
            settings.preset = self.preset.clone();
        }
        settings.output_dir = self.output_dir.clone();
        settings.subfolder_per_project = self.subfolder;
        settings.start_frame = self.start;
        settings.end_frame = self.end;
        settings.layer_comp = self.layer_comp.clone();
        settings.quality = self.quality;
        settings.depth = self.depth;
        settings.video_codec = self.video_codec;
        settings.multithread = self.multithread;
        settings.half_size = self.half_size;
        settings.half_fps = self.half_fps;
        settings.shape_fx = self.shape_fx;
        settings.layer_fx = self.layer_fx;
        settings.antialias = self.antialias;
        settings.copy_images = self.copy_images;
        settings.compose_layers = self.compose;
        settings.reverse_layer_order = self.reverse_layers;
        settings.log_file = self.log_file.clone();
        settings
    }
}

// =============================================================================
// Local queue
// =============================================================================

async fn open_queue(config: &AppConfig, persistent: bool) -> Result<QueueManager, Box<dyn std::error::Error>> {
    let supervisor = RenderSupervisor::new(config.renderer.clone()).with_log_dir(config.log_dir()?);
    let mut builder = QueueManager::builder(Arc::new(supervisor)).max_concurrent(config.queue.max_concurrent);
    if persistent {
        builder = builder.snapshot(SnapshotStore::new(config.snapshot_path()?));
    }
    if let Some(program) = &config.queue.compositor {
        let compositor = config
            .queue
            .compositor_args
            .iter()
            .fold(CommandCompositor::new(program), |c, a| c.arg(a));
        builder = builder.compositor(Arc::new(compositor));
    }
    Ok(builder.open().await?)
}

/// Start the queue and wait until it runs dry or the process is told to stop.
async fn run_until_idle(queue: &QueueManager) {
    let shutdown = install_shutdown_handler();
    let mut events = queue.subscribe();
    queue.start().await;

    let printer = tokio::spawn(async move {
        use render_farm::scheduler::QueueEvent;
        while let Ok(event) = events.recv().await {
            match event {
                QueueEvent::StatusChanged { id, to, .. } => println!("[{:#}] {}", id, to),
                QueueEvent::Output { id, line } => println!("[{:#}] {}", id, line),
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = queue.wait_idle() => {}
        _ = shutdown.cancelled() => {
            eprintln!("Stopping renders...");
            queue.stop().await;
        }
    }
    queue.shutdown().await;
    printer.abort();
}

fn print_summary(jobs: &[Job]) -> bool {
    let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
    let completed = jobs.iter().filter(|j| j.status == JobStatus::Completed).count();
    println!();
    println!("{} completed, {} failed, {} total", completed, failed, jobs.len());
    for job in jobs.iter().filter(|j| j.status == JobStatus::Failed) {
        println!(
            "  {}: {}",
            job.project.display(),
            job.error.as_deref().unwrap_or("unknown error")
        );
    }
    failed == 0
}

async fn handle_render(
    config: &AppConfig,
    files: Vec<PathBuf>,
    settings: RenderSettings,
) -> Result<bool, Box<dyn std::error::Error>> {
    let queue = open_queue(config, false).await?;
    for file in files {
        let id = queue.add(&file, settings.clone()).await?;
        println!("Queued {} as {:#}", file.display(), id);
    }
    run_until_idle(&queue).await;
    Ok(print_summary(&queue.jobs().await))
}

fn print_jobs(jobs: &[Job], output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:>6} {:<12} {:<20} PROJECT",
                "JOB ID", "STATUS", "DONE", "FORMAT", "NODE"
            );
            println!("{}", "-".repeat(100));
            for job in jobs {
                let node = job
                    .assigned_node
                    .as_ref()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<10} {:>5.0}% {:<12} {:<20} {}",
                    job.id.to_string(),
                    job.status.to_string(),
                    job.progress * 100.0,
                    job.settings.format.to_string(),
                    node,
                    job.project.display()
                );
                if let Some(error) = &job.error {
                    println!("    error: {}", error);
                }
            }
        }
    }
    Ok(())
}

async fn handle_queue(config: &AppConfig, command: QueueCommands) -> Result<bool, Box<dyn std::error::Error>> {
    let queue = open_queue(config, true).await?;
    match command {
        QueueCommands::Add { files, settings } => {
            let settings = settings.to_settings();
            for file in files {
                let id = queue.add(&file, settings.clone()).await?;
                println!("Queued {} as {}", file.display(), id);
            }
        }
        QueueCommands::List { output } => print_jobs(&queue.jobs().await, &output)?,
        QueueCommands::Run => {
            let before: Vec<JobId> = queue.jobs().await.iter().map(|j| j.id).collect();
            run_until_idle(&queue).await;
            let jobs: Vec<Job> = queue
                .jobs()
                .await
                .into_iter()
                .filter(|j| before.contains(&j.id))
                .collect();
            return Ok(print_summary(&jobs));
        }
        QueueCommands::Retry { job_id } => {
            queue.retry(&job_id).await?;
            println!("Job {} is pending again", job_id);
        }
        QueueCommands::Remove { job_id } => {
            let job = queue.remove(&job_id).await?;
            println!("Removed {} ({})", job_id, job.project.display());
        }
        QueueCommands::Export { path } => {
            let n = queue.export(&path).await?;
            println!("Exported {} jobs to {}", n, path.display());
        }
        QueueCommands::Import { path, append } => {
            let n = queue.import(&path, append).await?;
            println!("Imported {} jobs from {}", n, path.display());
        }
        QueueCommands::Clear => {
            let n = queue.clear_finished().await;
            println!("Cleared {} finished jobs", n);
        }
    }
    Ok(true)
}

// =============================================================================
// Farm
// =============================================================================

async fn handle_master(config: &AppConfig, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = port.unwrap_or(config.farm.port);
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let transfer_dir = config.transfer_dir()?;
    let transfers = TransferStore::new(&transfer_dir);
    let registry = Arc::new(FarmRegistry::new(&config.farm).with_transfers(transfers));

    tracing::info!(
        addr = %addr,
        heartbeat_ms = config.farm.heartbeat_interval_ms,
        liveness_ms = config.farm.liveness_timeout_ms,
        transfer_dir = %transfer_dir.display(),
        "Starting farm master"
    );

    let shutdown = install_shutdown_handler();
    let sweeper = tokio::spawn(
        Arc::clone(&registry).run_sweeper(config.farm.sweep_interval(), shutdown.clone()),
    );
    run_server(registry, addr, config.farm.max_bundle_bytes, shutdown.clone()).await?;
    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}

fn discovery_options(config: &AppConfig) -> DiscoveryOptions {
    DiscoveryOptions {
        port: config.farm.port,
        probe_timeout: std::time::Duration::from_millis(config.farm.discovery_timeout_ms),
        concurrency: config.farm.discovery_concurrency,
    }
}

fn local_hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "render-node".to_string())
}

async fn handle_slave(
    config: &AppConfig,
    master: Option<String>,
    discover: bool,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let master = if discover {
        match discovery::discover_local(&discovery_options(config)).await {
            Ok(Some(found)) => found.url,
            Ok(None) => return Err("no farm master found; pass --master".into()),
            Err(e) => return Err(format!("discovery failed: {}; pass --master", e).into()),
        }
    } else {
        master.unwrap_or_else(|| config.farm.master_url())
    };

    let client = FarmClient::new(
        &master,
        config.farm.request_timeout(),
        config.farm.transfer_timeout(),
    )?;
    let queue = open_queue(config, true).await?;
    let agent_config = AgentConfig {
        hostname: local_hostname(),
        port,
        heartbeat_interval: config.farm.heartbeat_interval(),
        poll_interval: config.farm.poll_interval(),
        work_dir: config.work_dir()?,
        max_bundle_bytes: config.farm.max_bundle_bytes,
        backoff: Backoff::from(&config.farm.retry),
    };
    tracing::info!(master = %master, capacity = config.queue.max_concurrent, "Starting render node");

    let agent = Arc::new(FarmAgent::new(client, queue.clone(), agent_config));
    let shutdown = install_shutdown_handler();
    agent.run(shutdown).await?;
    queue.shutdown().await;
    Ok(())
}

fn farm_client(config: &AppConfig, args: &ClientArgs) -> Result<FarmClient, Box<dyn std::error::Error>> {
    let url = args.master.clone().unwrap_or_else(|| config.farm.master_url());
    Ok(FarmClient::new(
        url,
        config.farm.request_timeout(),
        config.farm.transfer_timeout(),
    )?)
}

fn print_nodes(nodes: &[NodeInfo]) {
    println!("Nodes:");
    if nodes.is_empty() {
        println!("  (none)");
        return;
    }
    println!(
        "{:<28} {:<16} {:<10} {:>4} {:>5} {:>5} {:>8}",
        "NODE ID", "HOSTNAME", "STATE", "CAP", "DONE", "FAIL", "SEEN"
    );
    println!("{}", "-".repeat(84));
    for node in nodes {
        println!(
            "{:<28} {:<16} {:<10} {:>4} {:>5} {:>5} {:>7}s",
            node.node_id.to_string(),
            node.hostname,
            node.state.to_string(),
            node.capacity,
            node.jobs_completed,
            node.jobs_failed,
            node.last_seen_secs
        );
    }
}

fn print_status(status: &StatusResponse, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(status)?),
        OutputFormat::Table => {
            println!("Farm Status");
            println!("{}", "=".repeat(40));
            println!("Pending: {}", status.pending);
            println!("Active:  {}", status.active);
            println!();
            print_nodes(&status.nodes);
            println!();
            print_jobs(&status.jobs, &OutputFormat::Table)?;
        }
    }
    Ok(())
}

async fn handle_farm(
    config: &AppConfig,
    client_args: ClientArgs,
    command: FarmCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = farm_client(config, &client_args)?;
    match command {
        FarmCommands::Submit {
            files,
            bundle,
            pin,
            settings,
        } => {
            let settings = settings.to_settings();
            for file in files {
                let options = SubmitOptions {
                    bundle,
                    include_siblings: config.farm.include_sibling_assets,
                    max_bundle_bytes: config.farm.max_bundle_bytes,
                    pinned_to: pin.clone().map(NodeId),
                };
                let id = client.submit_job(&file, settings.clone(), options).await?;
                match client_args.output {
                    OutputFormat::Json => println!("{}", serde_json::json!({ "job_id": id })),
                    OutputFormat::Table => println!("Submitted {} as {}", file.display(), id),
                }
            }
        }
        FarmCommands::Status => print_status(&client.status().await?, &client_args.output)?,
        FarmCommands::Queue => {
            let queue = client.queue().await?;
            match client_args.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&queue)?),
                OutputFormat::Table => {
                    println!("Active:");
                    print_jobs(&queue.active, &OutputFormat::Table)?;
                    println!();
                    println!("Pending:");
                    print_jobs(&queue.pending, &OutputFormat::Table)?;
                }
            }
        }
        FarmCommands::Cancel { job_id } => {
            client.cancel(&job_id).await?;
            println!("Cancellation requested for {}", job_id);
        }
        FarmCommands::Assign { job_id, node_id } => {
            let node = node_id.map(NodeId);
            client.assign(&job_id, node.clone()).await?;
            match node {
                Some(node) => println!("Job {} pinned to {}", job_id, node),
                None => println!("Job {} unpinned", job_id),
            }
        }
        FarmCommands::Retry { job_id } => {
            client.retry(&job_id).await?;
            println!("Job {} is pending again", job_id);
        }
        FarmCommands::Remove { job_id } => {
            client.remove(&job_id).await?;
            println!("Removed {}", job_id);
        }
    }
    Ok(())
}

async fn handle_discover(config: &AppConfig, subnet: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let options = discovery_options(config);
    let found = match subnet {
        Some(cidr) => {
            let network: ipnetwork::IpNetwork = cidr.parse()?;
            discovery::discover(discovery::candidate_hosts(network), &options).await?
        }
        None => discovery::discover_local(&options).await?,
    };
    match found {
        Some(master) => {
            println!("Farm master: {}", master.url);
            print_nodes(&master.status.nodes);
        }
        None => println!("No farm master found. Pass the address with --master."),
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    let ok = match cli.command {
        Commands::Render { files, settings } => {
            handle_render(&config, files, settings.to_settings()).await?
        }
        Commands::Queue { command } => handle_queue(&config, command).await?,
        Commands::Master { port } => {
            handle_master(&config, port).await?;
            true
        }
        Commands::Slave {
            master,
            discover,
            port,
        } => {
            handle_slave(&config, master, discover, port).await?;
            true
        }
        Commands::Farm { client, command } => {
            handle_farm(&config, client, command).await?;
            true
        }
        Commands::Discover { subnet } => {
            handle_discover(&config, subnet).await?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
