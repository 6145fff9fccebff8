use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use liquer_core::config::Config;
use liquer_core::error::Error;
use liquer_server::environment::ServerEnvironment;
use liquer_server::presets::{create_environment, create_pool};
use liquer_server::value::encode_state;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Evaluate liquer queries or serve them over HTTP
#[derive(Parser, Debug)]
#[command(name = "liquer", version, about)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preset overriding setup.preset
    #[arg(long)]
    preset: Option<String>,

    /// Evaluate the query and write the result to the output directory
    #[arg(short, long)]
    query: Option<String>,

    /// Output directory for --query
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Start the HTTP server
    #[arg(short, long)]
    serve: bool,

    /// Allow registering commands over HTTP
    #[arg(long)]
    enable_remote_registration: bool,
}

fn load_config(args: &Args) -> Result<Config, Error> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::new(),
    };
    if let Some(preset) = &args.preset {
        config.setup.preset = preset.clone();
    }
    Ok(config)
}

/// Evaluate the query; an error state is reported and gives a failure exit code
fn run_query(config: &Config, query: &str, output: &Path) -> Result<ExitCode, Error> {
    let envref = create_environment(config)?;
    let state = envref.evaluate(query)?;
    if let Err(e) = state.get() {
        eprintln!("Error: {}", e);
        for line in e.traceback.iter() {
            eprintln!("{}", line);
        }
        return Ok(ExitCode::FAILURE);
    }
    let data = encode_state(&state, &envref.get_state_types())?;
    let filename = data.filename.unwrap_or_else(|| "data.b".to_owned());
    std::fs::create_dir_all(output).map_err(|e| {
        Error::general_error(format!("Can't create {}: {}", output.display(), e))
    })?;
    let path = output.join(filename);
    std::fs::write(&path, &data.data)
        .map_err(|e| Error::general_error(format!("Can't write {}: {}", path.display(), e)))?;
    info!(%query, path = %path.display(), "result written");
    Ok(ExitCode::SUCCESS)
}

fn serve(config: &Config, enable_remote_registration: bool) -> Result<(), Error> {
    let envref = create_environment(config)?;
    if enable_remote_registration {
        envref.enable_remote_registration();
    }
    let mut server = ServerEnvironment::new(envref.clone())
        .with_url_prefix(&config.setup.url_prefix)
        .with_index_query(&config.setup.index_query);
    if let Some(pool) = create_pool(config, envref)? {
        server = server.with_pool(pool);
    }
    let app = liquer_server::router(server.to_ref());
    let address = format!("{}:{}", config.setup.host, config.setup.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::general_error(format!("Can't start the server runtime: {}", e)))?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|e| Error::configuration_error(format!("Can't bind {}: {}", address, e)))?;
        info!(%address, prefix = %config.setup.url_prefix, "liquer server listening");
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::general_error(format!("Server failed: {}", e)))
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Some(query) = &args.query {
        return match run_query(&config, query, &args.output) {
            Ok(code) => code,
            Err(e) => {
                error!(%query, error = %e, "query failed");
                ExitCode::FAILURE
            }
        };
    }
    if args.serve {
        return match serve(&config, args.enable_remote_registration) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "server stopped");
                ExitCode::FAILURE
            }
        };
    }
    if let Err(e) = Args::command().print_help() {
        error!(error = %e, "can't print help");
    }
    ExitCode::SUCCESS
}
