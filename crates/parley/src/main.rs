use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley::api::{self, AppState};
use parley::auth::{AuthConfig, AuthState, Role};
use parley::config::AppConfig;
use parley::db::Database;
use parley::sync::{
    DebounceConfig, HttpReconciliationFetcher, SyncMultiplexer, SyncScope, SyncUpdate,
    WsSyncClient, forward_events,
};
use parley_protocol::Channel;

const APP_NAME: &str = "parley";

/// How long shutdown waits for in-flight streams to finalize.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Account dev users are provisioned into.
const DEV_ACCOUNT_ID: &str = "acct_dev";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_provision(ctx: RuntimeContext, cmd: ProvisionCommand) -> Result<()> {
    handle_provision(&ctx, cmd).await
}

#[tokio::main]
async fn async_watch(ctx: RuntimeContext, cmd: WatchCommand) -> Result<()> {
    handle_watch(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Token(cmd) => handle_token(&ctx, cmd),
        Command::Provision(cmd) => async_provision(ctx, cmd),
        Command::Watch(cmd) => async_watch(ctx, cmd),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Parley - live chat backend with mutation broadcast and reconciliation.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP and WebSocket server
    Serve(ServeCommand),
    /// Create a config file with a fresh JWT secret
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Mint a JWT for a user with the configured secret
    Token(TokenCommand),
    /// Create an account and a user with fixed ids
    Provision(ProvisionCommand),
    /// Follow channels and print reconciled state as it changes
    Watch(WatchCommand),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

#[derive(Debug, Clone, Args)]
struct TokenCommand {
    /// User id the token acts as
    user_id: String,
    /// Display name carried in the token
    #[arg(long)]
    name: Option<String>,
    /// Grant the admin role
    #[arg(long)]
    admin: bool,
}

#[derive(Debug, Clone, Args)]
struct ProvisionCommand {
    /// Account id (created if missing)
    #[arg(long)]
    account: String,
    /// Account name used when the account is created
    #[arg(long)]
    account_name: Option<String>,
    /// User id (created if missing)
    #[arg(long)]
    user: String,
    /// Display name of the user
    #[arg(long)]
    name: Option<String>,
    /// Mark the user as an administrator
    #[arg(long)]
    admin: bool,
}

#[derive(Debug, Clone, Args)]
struct WatchCommand {
    /// Server origin
    #[arg(long, default_value = "http://127.0.0.1:8480")]
    url: String,
    /// Bearer token
    #[arg(long, env = "PARLEY_TOKEN")]
    token: String,
    /// Channel bindings, e.g. `Conversation:conv_1=conversation:conv_1,messages:conv_1`
    #[arg(value_name = "CHANNEL=SLOT[,SLOT]", required = true)]
    bindings: Vec<String>,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // The core modules log through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::from_str(&self.config.logging.level).unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {}",
                self.paths.data_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })
    }

    fn database_path(&self) -> Result<PathBuf> {
        match &self.config.database.path {
            Some(path) => expand_str_path(path),
            None => Ok(self.paths.data_dir.join(format!("{APP_NAME}.db"))),
        }
    }

    fn output<T: serde::Serialize + fmt::Debug>(&self, value: &T) -> Result<()> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
        } else if self.common.yaml {
            println!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
        } else {
            println!("{value:#?}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists()
        && ctx.config.auth.jwt_secret.is_some()
        && !(cmd.force || ctx.common.assume_yes)
    {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write config with a new JWT secret to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    let mut config = AppConfig::default();
    config.auth.jwt_secret = Some(AuthConfig::generate_jwt_secret());
    write_config(&ctx.paths.config_file, &config)?;
    println!("Wrote {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.output(&ctx.config),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_config(&ctx.paths.config_file, &AppConfig::default())
        }
    }
}

fn handle_token(ctx: &RuntimeContext, cmd: TokenCommand) -> Result<()> {
    let auth = AuthState::new(ctx.config.auth.clone());
    let role = if cmd.admin { Role::Admin } else { Role::User };
    let name = cmd.name.as_deref().unwrap_or(&cmd.user_id);
    let token = auth
        .generate_token(&cmd.user_id, name, role)
        .map_err(|e| anyhow!("generating token: {e}"))?;
    println!("{token}");
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_provision(ctx: &RuntimeContext, cmd: ProvisionCommand) -> Result<()> {
    let db_path = ctx.database_path()?;
    if ctx.common.dry_run {
        info!(
            "dry-run: would provision {} in {} at {}",
            cmd.user,
            cmd.account,
            db_path.display()
        );
        return Ok(());
    }

    let database = Database::new(&db_path).await?;
    let state = AppState::new(
        &database,
        AuthState::new(ctx.config.auth.clone()),
        ctx.config.sync.clone(),
    );
    let created = state
        .repo
        .ensure_user(
            &cmd.account,
            cmd.account_name.as_deref().unwrap_or(&cmd.account),
            &cmd.user,
            cmd.name.as_deref().unwrap_or(&cmd.user),
            cmd.admin,
        )
        .await?;

    if created {
        println!("Created user {} in account {}", cmd.user, cmd.account);
    } else {
        println!("User {} already exists", cmd.user);
    }
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting parley server...");

    let db_path = ctx.database_path()?;
    info!("Database path: {}", db_path.display());
    let database = Database::new(&db_path).await?;

    let auth_config = ctx.config.auth.clone();
    auth_config
        .validate()
        .context("Invalid auth configuration")?;
    info!(
        "Auth mode: {}",
        if auth_config.dev_mode {
            "development"
        } else {
            "production"
        }
    );

    let state = AppState::new(
        &database,
        AuthState::new(auth_config.clone()),
        ctx.config.sync.clone(),
    );

    if auth_config.dev_mode {
        for user in &auth_config.dev_users {
            let created = state
                .repo
                .ensure_user(
                    DEV_ACCOUNT_ID,
                    "Development",
                    &user.id,
                    &user.name,
                    user.role == Role::Admin,
                )
                .await
                .with_context(|| format!("provisioning dev user {}", user.id))?;
            if created {
                info!("Provisioned dev user {} in {}", user.id, DEV_ACCOUNT_ID);
            }
        }
    }

    state.hub.start();
    let app = api::create_router(state.clone());

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let shutdown_state = state.clone();
    let shutdown_signal = async move {
        wait_for_shutdown_signal().await;

        info!("Shutdown signal received, stopping streams and hub...");
        // Streams notify through the hub while finalizing, so drain them first.
        if !shutdown_state.streams.shutdown(STREAM_DRAIN_TIMEOUT).await {
            warn!("Some streams did not finalize before shutdown");
        }
        shutdown_state.hub.stop();
        info!("Shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_watch(ctx: &RuntimeContext, cmd: WatchCommand) -> Result<()> {
    let bindings = parse_bindings(&cmd.bindings)?;
    let sync = &ctx.config.sync;

    let client = WsSyncClient::new(&cmd.url, cmd.token.clone(), sync);
    let fetcher = HttpReconciliationFetcher::new(&cmd.url, cmd.token.clone());
    let (handle, mut updates, multiplexer) = SyncMultiplexer::spawn(
        Arc::new(client.clone()),
        Arc::new(fetcher),
        DebounceConfig::from(sync),
    );
    let scope = SyncScope::new(handle.clone());

    // Declared before the transport starts: the first connection then
    // subscribes everything and performs the initial full fetch.
    let report = handle.reconfigure(bindings).await?;
    debug!("{} channel(s) pending first connection", report.failed.len());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let transport = client.run(events_tx, cancel.clone());
    let forwarder = tokio::spawn(forward_events(handle.clone(), events_rx));
    info!("Watching {} via {}", cmd.bindings.join(" "), client.url());

    loop {
        tokio::select! {
            _ = wait_for_shutdown_signal() => break,
            update = updates.recv() => match update {
                Some(update) => print_update(ctx, &update)?,
                None => break,
            },
        }
    }

    // Unsubscribes go out before the transport closes.
    drop(scope);
    let _ = multiplexer.await;
    cancel.cancel();
    let _ = transport.await;
    forwarder.abort();
    Ok(())
}

fn print_update(ctx: &RuntimeContext, update: &SyncUpdate) -> Result<()> {
    match update {
        SyncUpdate::Reconciled { reason, response } => {
            if ctx.common.json || ctx.common.yaml {
                return ctx.output(&response.slots);
            }
            println!("-- {reason:?}");
            for (slot, value) in &response.slots {
                let text = serde_json::to_string(value).context("serializing slot value")?;
                println!("{slot}: {text}");
            }
        }
        SyncUpdate::FetchFailed {
            reason,
            slots,
            error,
        } => {
            warn!("{:?} fetch of {} failed: {}", reason, slots.join(","), error);
        }
    }
    Ok(())
}

/// Parse `CHANNEL=SLOT[,SLOT]` arguments.
fn parse_bindings(args: &[String]) -> Result<BTreeMap<Channel, BTreeSet<String>>> {
    let mut bindings: BTreeMap<Channel, BTreeSet<String>> = BTreeMap::new();
    for arg in args {
        let (channel, slots) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("binding {arg:?} must look like CHANNEL=SLOT[,SLOT]"))?;
        let channel: Channel = channel
            .parse()
            .with_context(|| format!("invalid channel in {arg:?}"))?;
        bindings.entry(channel).or_default().extend(
            slots
                .split(',')
                .map(str::trim)
                .filter(|slot| !slot.is_empty())
                .map(str::to_string),
        );
    }
    Ok(bindings)
}

fn load_or_init_config(paths: &mut AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_config(&paths.config_file, &AppConfig::default())?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(config).context("serializing config to TOML")?;
    let mut body = config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n",
        path.display()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}
