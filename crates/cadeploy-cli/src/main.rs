use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "cadeploy",
    about = "cadeploy — deploy paired app and cache workloads",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Deployer configuration (TOML)
    #[arg(short, long, global = true, default_value = "deployer.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an app and its cache
    Create {
        /// Deployment id, `<owner>-<localName>`
        id: String,
        /// Container image of the app
        image: String,
        /// Run in the untrusted tier (true or false)
        #[arg(action = ArgAction::Set)]
        is_untrusted: bool,
        /// Scaling plan
        plan: String,
        /// Cache instance timestamp (digits)
        timestamp: Option<String>,
    },
    /// Rescale an app for a plan and CA load
    Flex {
        id: String,
        plan: String,
        number_of_cas: u32,
    },
    /// Roll an app onto a new image
    ChangeImage { id: String, image: String },
    /// Print the status of every app as JSON
    Stat,
    /// Delete an app and its cache
    Delete {
        id: String,
        /// Keep the cache's dedicated volume (true or false)
        #[arg(action = ArgAction::Set)]
        keep_data: bool,
    },
    /// Restart every instance of an app
    Restart { id: String },
    /// Write a configuration scaffold
    Init {
        #[arg(long, default_value = "apps")]
        app_namespace: String,
        #[arg(long, default_value = "caches")]
        redis_namespace: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadeploy=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_path();

    match cli.command {
        Commands::Create {
            id,
            image,
            is_untrusted,
            plan,
            timestamp,
        } => commands::create(config, &id, &image, is_untrusted, &plan, timestamp).await,
        Commands::Flex {
            id,
            plan,
            number_of_cas,
        } => commands::flex(config, &id, &plan, number_of_cas).await,
        Commands::ChangeImage { id, image } => commands::change_image(config, &id, &image).await,
        Commands::Stat => commands::stat(config).await,
        Commands::Delete { id, keep_data } => commands::delete(config, &id, keep_data).await,
        Commands::Restart { id } => commands::restart(config, &id).await,
        Commands::Init {
            app_namespace,
            redis_namespace,
        } => commands::init(config, &app_namespace, &redis_namespace),
    }
}
