mod config;
mod errors;
mod services;

use authenticator::{KeySet, TenantPolicy, TenantResolver, TokenVerifier};
use clap::{Args, Parser, Subcommand};
use config::Config;
use errors::GatewayError;
use services::{
    CONFIG_NAMESPACE, CORTEX_NAMESPACE, ConfigUpstreams, CortexUpstreams, DDAPI_NAMESPACE,
    LOKI_NAMESPACE, LokiUpstreams, ProxyFactory,
};
use shared::http::{error_chain, run_http_service};
use shared::logging::{self, LogLevel};
use shared::prometheus::PrometheusExporter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use url::Url;

const FALLBACK_UPSTREAM: &str = "http://localhost";

#[derive(Parser, Debug)]
#[command(about = "Authenticating, tenant-injecting front door for Cortex, Loki and Datadog agents")]
struct Cli {
    /// Optional YAML file with logging and metrics settings.
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Proxy the Cortex HTTP API.
    Cortex(CortexArgs),
    /// Proxy the Loki HTTP API.
    Loki(LokiArgs),
    /// Proxy Cortex rule and alertmanager configuration for any tenant.
    Config(ConfigArgs),
    /// Accept Datadog agent submissions and forward them via remote_write.
    Ddapi(DdapiArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// `host:port`, or `:port` for all interfaces.
    #[arg(long)]
    listen: String,

    /// error, info or debug. `RUST_LOG` takes precedence.
    #[arg(long, default_value_t = LogLevel::Info)]
    loglevel: LogLevel,

    /// Testing mode: no token verification, the tenant comes from the
    /// `X-Scope-OrgID` header or `--tenantname`.
    #[arg(long)]
    disable_api_authn: bool,
}

#[derive(Args, Debug)]
struct CortexArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Accept only this tenant. Empty accepts any.
    #[arg(long, default_value = "")]
    tenantname: String,

    #[arg(long)]
    cortex_querier_url: Url,

    #[arg(long)]
    cortex_distributor_url: Url,

    #[arg(long)]
    cortex_ruler_url: Url,

    #[arg(long)]
    cortex_alertmanager_url: Url,

    /// Pass push errors through unchanged, letting clients retry them.
    #[arg(long)]
    allow_push_retries: bool,
}

#[derive(Args, Debug)]
struct LokiArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, default_value = "")]
    tenantname: String,

    #[arg(long)]
    loki_querier_url: Url,

    #[arg(long)]
    loki_distributor_url: Url,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, env = "CORTEX_RULER_ENDPOINT")]
    cortex_ruler_url: Option<Url>,

    #[arg(long, env = "CORTEX_ALERTMANAGER_ENDPOINT")]
    cortex_alertmanager_url: Option<Url>,
}

#[derive(Args, Debug)]
struct DdapiArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, default_value = "")]
    tenantname: String,

    #[arg(long)]
    prom_remote_write_url: Url,
}

impl Command {
    fn common(&self) -> &CommonArgs {
        match self {
            Command::Cortex(args) => &args.common,
            Command::Loki(args) => &args.common,
            Command::Config(args) => &args.common,
            Command::Ddapi(args) => &args.common,
        }
    }

    fn default_namespace(&self) -> &'static str {
        match self {
            Command::Cortex(_) => CORTEX_NAMESPACE,
            Command::Loki(_) => LOKI_NAMESPACE,
            Command::Config(_) => CONFIG_NAMESPACE,
            Command::Ddapi(_) => DDAPI_NAMESPACE,
        }
    }

    fn tenant_policy(&self) -> TenantPolicy {
        match self {
            Command::Cortex(args) => TenantPolicy::from_name(Some(args.tenantname.as_str())),
            Command::Loki(args) => TenantPolicy::from_name(Some(args.tenantname.as_str())),
            Command::Config(_) => TenantPolicy::Any,
            Command::Ddapi(args) => TenantPolicy::from_name(Some(args.tenantname.as_str())),
        }
    }
}

fn upstream_or_localhost(url: Option<&Url>, flag: &str) -> Result<Url, GatewayError> {
    match url {
        Some(url) => Ok(url.clone()),
        None => {
            tracing::warn!(flag, fallback = FALLBACK_UPSTREAM, "upstream not configured, using fallback");
            Ok(Url::parse(FALLBACK_UPSTREAM)?)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = error_chain(&e);
            tracing::error!(error = %message, "startup failed");
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), GatewayError> {
    let config = match &cli.config_file {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;

    let common = cli.command.common();
    let _sentry = logging::init(common.loglevel, config.sentry_options().as_ref())?;

    let namespace = config.namespace(cli.command.default_namespace());
    let exporter = Arc::new(PrometheusExporter::install(namespace)?);
    exporter.spawn_upkeep();

    let verifier = if common.disable_api_authn {
        tracing::warn!("API authentication disabled, trusting the X-Scope-OrgID header");
        None
    } else {
        let keys = KeySet::from_env()?;
        tracing::info!(keys = keys.len(), fallback = keys.has_fallback(), "loaded token verification keys");
        Some(Arc::new(TokenVerifier::new(keys)))
    };

    let policy = cli.command.tenant_policy();
    tracing::info!(
        listen = %common.listen,
        tenant = ?policy,
        authentication = verifier.is_some(),
        namespace,
        "starting"
    );
    let resolver = TenantResolver::new(policy, verifier);

    let router = match &cli.command {
        Command::Cortex(args) => services::cortex_router(
            &ProxyFactory::new(resolver),
            &CortexUpstreams {
                querier: args.cortex_querier_url.clone(),
                distributor: args.cortex_distributor_url.clone(),
                ruler: args.cortex_ruler_url.clone(),
                alertmanager: args.cortex_alertmanager_url.clone(),
                allow_push_retries: args.allow_push_retries,
            },
            namespace,
        )?,
        Command::Loki(args) => services::loki_router(
            &ProxyFactory::new(resolver),
            &LokiUpstreams {
                querier: args.loki_querier_url.clone(),
                distributor: args.loki_distributor_url.clone(),
            },
            namespace,
        )?,
        Command::Config(args) => services::config_router(
            &ProxyFactory::new(resolver),
            &ConfigUpstreams {
                ruler: upstream_or_localhost(args.cortex_ruler_url.as_ref(), "--cortex-ruler-url")?,
                alertmanager: upstream_or_localhost(
                    args.cortex_alertmanager_url.as_ref(),
                    "--cortex-alertmanager-url",
                )?,
            },
            namespace,
        )?,
        Command::Ddapi(args) => {
            services::ddapi_router(resolver, &args.prom_remote_write_url, namespace)?
        }
    };

    run_http_service(&common.listen, router.metrics_endpoint(exporter)).await?;
    Ok(())
}
