#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use poem::listener::TcpListener;
use poem::Server;
use tokio::task::JoinHandle;

use labelstore::config::{self, Environment, RuntimeConfig};
use labelstore::host::sqlite::{DatabaseConfig, SqliteDatabase};
use labelstore::host::{ipc, HostDispatcher};
use labelstore::provider::{
    select_data_access_kind,
    DataAccessKind,
    DataAccessProvider,
    HostEnvironment,
    StorageProvider,
};
use labelstore::storage::loader::load_display_bytes;
use labelstore::StorageAdapter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How many host requests may be queued before callers wait.
const HOST_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[clap(author, version, about = "Image storage and annotation data server.")]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Writes a starting configuration file.
    Init {
        /// The image storage backend, one of base64, filesystem, s3, azure or hybrid.
        #[clap(short, long, default_value = "filesystem")]
        backend: String,

        #[clap(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Runs the server with the given configuration.
    Run {
        /// The path to a config file in YAML format.
        #[clap(short, long, env = "LABELSTORE_CONFIG", default_value = "config.yaml")]
        config: PathBuf,
    },

    /// Works with the configured image storage directly.
    Images {
        #[clap(short, long, env = "LABELSTORE_CONFIG", default_value = "config.yaml")]
        config: PathBuf,

        #[clap(subcommand)]
        action: ImageAction,
    },
}

#[derive(Debug, Subcommand)]
enum ImageAction {
    /// Lists every stored image id.
    List,

    /// Stores a file under the given id.
    Put { image_id: String, file: PathBuf },

    /// Writes a stored image to a file.
    Get { image_id: String, output: PathBuf },

    Delete { image_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = Args::parse();

    match args.command {
        Commands::Init { backend, output } => run_init(&backend, output).await,
        Commands::Run { config } => {
            let cfg = setup(config).await?;
            run_server(cfg).await
        }
        Commands::Images { config, action } => {
            let cfg = setup(config).await?;
            run_images(cfg, action).await
        }
    }
}

async fn setup(path: PathBuf) -> Result<&'static RuntimeConfig> {
    let cfg = config::init(&path).await?;

    if let Some(level) = cfg.log_level.as_level() {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    Ok(cfg)
}

async fn run_init(backend: &str, output: PathBuf) -> Result<()> {
    let template = config::template(backend)?;
    tokio::fs::write(&output, template).await?;

    println!("wrote a {} configuration to {}", backend, output.display());
    Ok(())
}

/// Brings up the host loop when running as the desktop host.
async fn host_environment(
    cfg: &RuntimeConfig,
) -> Result<(HostEnvironment, Option<JoinHandle<()>>)> {
    let env = match cfg.environment {
        Environment::Server => (HostEnvironment::server(), None),
        Environment::Browser => (HostEnvironment::browser(), None),
        Environment::Desktop => {
            let database = SqliteDatabase::connect(DatabaseConfig {
                connection_uri: cfg.database_uri.clone(),
                pool_size: cfg.database_pool_size,
            })
            .await?;

            let mut dispatcher = HostDispatcher::new().with_database(database);
            if let Some(root) = cfg.host_root.as_ref() {
                dispatcher = dispatcher.with_root(root);
            }

            let (client, handle) = ipc::spawn(dispatcher, HOST_QUEUE_CAPACITY);
            (HostEnvironment::desktop(Arc::new(client)), Some(handle))
        }
    };

    Ok(env)
}

async fn connect_storage(
    cfg: &RuntimeConfig,
    env: &HostEnvironment,
) -> Result<Arc<dyn StorageAdapter>> {
    let storage = StorageProvider::new(env.clone())
        .with_backend(cfg.backend.clone())
        .with_image_directory(cfg.image_directory.clone())
        .connect()
        .await?;

    info!("image storage backend: {}", storage.name());
    Ok(storage)
}

async fn run_server(cfg: &'static RuntimeConfig) -> Result<()> {
    let (env, host) = host_environment(cfg).await?;

    // Without an explicit base url the API client would call this server.
    let kind = select_data_access_kind(&env, cfg.data_access)?;
    if kind == DataAccessKind::Api && cfg.api_base_url.is_none() {
        return Err(anyhow!(
            "the api data access needs `api_base_url` when serving, \
             set it or pick `document` or `sqlite` as the data_access"
        ));
    }

    let access = DataAccessProvider::new(env.clone())
        .with_override(cfg.data_access)
        .with_api_options(cfg.api_options())
        .get()?;
    let storage = connect_storage(cfg, &env).await?;

    let app = labelstore::routes::build_app(storage, access);

    info!("serving requests @ http://{}", cfg.bind_address());
    info!("image API docs @ http://{}/ui", cfg.bind_address());

    Server::new(TcpListener::bind(cfg.bind_address()))
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            },
            Some(Duration::from_secs(5)),
        )
        .await?;

    if let Some(host) = host {
        host.abort();
    }

    Ok(())
}

async fn run_images(cfg: &'static RuntimeConfig, action: ImageAction) -> Result<()> {
    let (env, _host) = host_environment(cfg).await?;
    let storage = connect_storage(cfg, &env).await?;

    match action {
        ImageAction::List => {
            let mut ids = storage.list_images().await?;
            ids.sort();
            for id in ids {
                println!("{}", id);
            }
        }
        ImageAction::Put { image_id, file } => {
            let data = tokio::fs::read(&file).await?;
            let checksum = labelstore::utils::checksum(&data);
            storage.save_image(&image_id, data.into()).await?;
            println!("stored {} (crc32 {:08x})", image_id, checksum);
        }
        ImageAction::Get { image_id, output } => {
            let image = load_display_bytes(storage.as_ref(), &image_id).await?;
            tokio::fs::write(&output, &image.data).await?;
            println!("wrote {} ({}) to {}", image_id, image.content_type, output.display());
        }
        ImageAction::Delete { image_id } => {
            storage.delete_image(&image_id).await?;
            println!("deleted {}", image_id);
        }
    }

    Ok(())
}
