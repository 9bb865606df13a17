use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use realty_gateway::{
    adapters::{
        HttpClientAdapter, HttpHandler, MemoryRateLimitStore, PermissionClient, build_router,
    },
    config::{GatewayConfig, ServerConfigValidator, load_config},
    core::RateLimiter,
    metrics,
    ports::{http_client::HttpClient, permission_authority::PermissionAuthority},
    tracing_setup,
    utils::graceful_shutdown::{GracefulShutdown, ShutdownReason},
};

const METRICS_UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config: GatewayConfig = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    tracing_setup::init_tracing(&config.log)?;
    tracing::info!("Loaded configuration from {config_path}");

    ServerConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}: {e}"))?;

    let metrics_handle = metrics::install_prometheus_recorder()?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let config = Arc::new(config);

    let http_client: Arc<dyn HttpClient> = Arc::new(
        HttpClientAdapter::new(Duration::from_secs(config.upstream.timeout_secs))
            .context("Failed to create HTTP client adapter")?,
    );
    let authority: Arc<dyn PermissionAuthority> = Arc::new(
        PermissionClient::new(&config.authority)
            .context("Failed to create permission authority client")?,
    );
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryRateLimitStore::new()),
        config.rate_limits.clone(),
    ));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());

    let handler = Arc::new(
        HttpHandler::new(config.clone(), http_client, authority, limiter.clone())
            .with_metrics_handle(metrics_handle.clone())
            .with_shutdown_flag(graceful_shutdown.initiated_flag()),
    );

    let sweeper = limiter.spawn_sweeper(
        Duration::from_secs(config.rate_limits.sweep_interval_secs.max(1)),
        graceful_shutdown.shutdown_token(),
    );

    let upkeep = metrics::spawn_upkeep(
        metrics_handle,
        METRICS_UPKEEP_INTERVAL,
        graceful_shutdown.shutdown_token(),
    );

    let signal_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    tracing::info!(
        "Realty gateway listening on {} ({} routes, {} services, {} admin domains)",
        addr,
        handler.route_count(),
        config.services.len(),
        config.admin.domains.len()
    );

    let app = build_router(handler.clone());
    handler.mark_ready();

    let mut shutdown_token = graceful_shutdown.shutdown_token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = shutdown_token.wait_for_shutdown().await;
        tracing::info!("Shutdown signal received: {:?}, draining connections", reason);
    });

    // In-flight requests get the drain window once the signal arrives; the
    // server future itself only resolves after every connection closes.
    let mut drain_token = graceful_shutdown.shutdown_token();
    let drain_timeout = graceful_shutdown.drain_timeout();
    let server_result = tokio::select! {
        result = server.into_future() => result.context("Server error"),
        _ = async {
            drain_token.wait_for_shutdown().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            tracing::warn!(
                "Drain timeout of {:?} elapsed, closing remaining connections",
                drain_timeout
            );
            Ok(())
        }
    };

    // A server error ends the process without a signal; stop background tasks too.
    if !graceful_shutdown.is_shutdown_initiated() {
        graceful_shutdown.trigger_shutdown(ShutdownReason::Requested)?;
    }
    if let Err(e) = sweeper.await {
        tracing::warn!("Rate limit sweeper ended abnormally: {}", e);
    }
    if let Err(e) = upkeep.await {
        tracing::warn!("Metrics upkeep ended abnormally: {}", e);
    }

    server_result?;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Services: {}", config.services.len());
            println!("   • Routes: {}", config.routes.len());
            println!("   • Admin Domains: {}", config.admin.domains.len());
            println!(
                "   • Rate Limits: default {}/{}ms, auth {}/{}ms, webhook {}/{}ms",
                config.rate_limits.default.max,
                config.rate_limits.default.window_ms,
                config.rate_limits.auth.max,
                config.rate_limits.auth.window_ms,
                config.rate_limits.webhook.max,
                config.rate_limits.webhook.window_ms
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all service URLs start with http:// or https://");
            println!("   • Declare every service a route or admin domain refers to");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Set auth.jwt_secret and internal.token (or GATEWAY__* env vars)");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Realty Gateway Configuration

listen_addr = "0.0.0.0:8080"

[auth]
# Prefer GATEWAY__AUTH__JWT_SECRET in deployed environments
jwt_secret = "change-me"
issuer = "realty-auth"
audience = "realty-api"

[internal]
prefix = "/internal/v1"
token_header = "x-internal-token"
token = "change-me-too"

[authority]
base_url = "http://localhost:4001"
timeout_ms = 2000

[services.org]
base_url = "http://localhost:4001"

[services.property]
base_url = "http://localhost:4002"

[admin]
prefix = "/v1/admin"

[admin.domains.properties]
service = "property"
rewrite_to = "/api/admin"

[rate_limits]
sweep_interval_secs = 60
default = { window_ms = 900000, max = 1000 }
auth = { window_ms = 900000, max = 10 }
webhook = { window_ms = 60000, max = 100 }

[[routes]]
method = "POST"
path = "/v1/auth/login"
service = "org"
rate_limit = "auth"
rewrite = { from = "/v1/auth", to = "/api/auth" }

[[routes]]
method = "GET"
path = "/v1/properties/*"
service = "property"
auth = { type = "optional" }
rewrite = { from = "/v1/properties", to = "/api/properties" }

[[routes]]
method = "ANY"
path = "/v1/leads/*"
service = "org"
auth = { type = "permission", permissions = ["leads:read"] }

[log]
level = "info"
json = true
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'realty-gateway serve --config {config_path}' to start the server");
    Ok(())
}
