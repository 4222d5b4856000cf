use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use throttle::config::ThrottleOptions;
use throttle::guard::{Admission, EndpointThrottle, ThrottleGuard};
use throttle::mesh::Cluster;
use throttle::net::resolve_client_ip;
use throttle::policy::{RequestContext, ThrottleService};
use throttle::ratelimit::{
    MemoryStore, MeshStore, RateLimitPeriod, RateLimitResult, RateLimitStore, RateLimiter,
    RateQuota, REJECTION_STATUS,
};

/// Request admission control.
#[derive(Debug, Parser)]
#[command(name = "throttle", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "THROTTLE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Keep limiter state in the gossip mesh
    #[arg(long, global = true)]
    distributed: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the configuration and report what it contains
    Validate,
    /// Show the identity, whitelist status and quotas for a request
    Identity(RequestArgs),
    /// Run admission checks for a request
    Check {
        #[command(flatten)]
        request: RequestArgs,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Units charged per request
        #[arg(short, long, default_value_t = 1)]
        quantity: u32,

        /// Pause between requests, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Endpoint quota as `max_rate,max_burst,period`
        #[arg(long, value_parser = parse_quota)]
        endpoint_quota: Option<RateQuota>,

        /// Treat the endpoint as opted out of throttling
        #[arg(long, conflicts_with = "endpoint_quota")]
        disabled: bool,
    },
}

#[derive(Debug, Args)]
struct RequestArgs {
    /// HTTP method
    #[arg(short, long, default_value = "GET")]
    method: String,

    /// Request path
    #[arg(short, long, default_value = "/")]
    path: String,

    /// Remote (socket) address of the client
    #[arg(long)]
    remote: Option<IpAddr>,

    /// `X-Forwarded-For` header value
    #[arg(long)]
    forwarded_for: Option<String>,

    /// `User-Agent` header value; repeat for multiple values
    #[arg(short = 'u', long)]
    user_agent: Vec<String>,

    /// Handler group name
    #[arg(long)]
    controller: Option<String>,

    /// Handler name
    #[arg(long)]
    action: Option<String>,
}

impl RequestArgs {
    fn to_context(&self) -> RequestContext {
        let client = resolve_client_ip(self.remote, self.forwarded_for.as_deref(), true);
        let mut ctx = RequestContext::new(self.method.clone(), self.path.clone(), client);
        ctx.user_agent = self.user_agent.clone();
        ctx.controller_name = self.controller.clone();
        ctx.action_name = self.action.clone();
        ctx
    }
}

fn parse_quota(s: &str) -> Result<RateQuota, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let (rate, burst, period) = match parts.as_slice() {
        [rate, burst] => (*rate, *burst, RateLimitPeriod::Second),
        [rate, burst, period] => (
            *rate,
            *burst,
            period.parse::<RateLimitPeriod>().map_err(|e| e.to_string())?,
        ),
        _ => return Err("expected max_rate,max_burst[,period]".to_string()),
    };

    let max_rate = rate.parse().map_err(|_| format!("invalid max_rate '{}'", rate))?;
    let max_burst = burst.parse().map_err(|_| format!("invalid max_burst '{}'", burst))?;
    Ok(RateQuota::new(max_rate, max_burst, period))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn result_json(result: &RateLimitResult) -> serde_json::Value {
    let headers: serde_json::Map<String, serde_json::Value> = result
        .headers()
        .into_iter()
        .map(|(name, value)| (name.to_string(), json!(value)))
        .collect();

    json!({
        "limited": result.is_limited(),
        "max_limit": result.max_limit,
        "remaining": result.remaining,
        "reset_after_ms": result.reset_after.num_milliseconds(),
        "retry_after_ms": result.retry_after_hint().map(|d| d.num_milliseconds()),
        "headers": headers,
    })
}

fn admission_json(seq: u32, admission: &Admission) -> serde_json::Value {
    match admission {
        Admission::Skipped => json!({ "request": seq, "decision": "skipped" }),
        Admission::Whitelisted => json!({ "request": seq, "decision": "whitelisted" }),
        Admission::Allowed { identity, results } => json!({
            "request": seq,
            "decision": "allowed",
            "identity": identity,
            "results": results.iter().map(result_json).collect::<Vec<_>>(),
        }),
        Admission::Limited { identity, result } => json!({
            "request": seq,
            "decision": "limited",
            "status": REJECTION_STATUS,
            "identity": identity,
            "result": result_json(result),
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut options = match &cli.config {
        Some(path) => ThrottleOptions::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ThrottleOptions::default(),
    };
    if cli.distributed {
        options.use_distributed = true;
    }

    let evaluator = options.validate().context("invalid configuration")?;

    match cli.command {
        Command::Validate => {
            let policy = evaluator.policy();
            println!(
                "{}",
                json!({
                    "valid": true,
                    "enable_global_filter": options.enable_global_filter,
                    "use_distributed": options.use_distributed,
                    "whitelist_entries": policy.ip_whitelist.len()
                        + policy.user_agent_whitelist.len()
                        + policy.path_whitelist.len(),
                    "ip_rules": policy.ip_rules.len(),
                    "user_agent_rules": policy.user_agent_rules.len(),
                    "path_rules": policy.path_rules.len(),
                })
            );
        }
        Command::Identity(request) => {
            let ctx = request.to_context();
            let identity = evaluator.identity(&ctx);
            println!(
                "{}",
                json!({
                    "client": ctx.client_address.to_string(),
                    "key": identity.to_string_key(),
                    "identity": identity.fingerprint(),
                    "whitelisted": evaluator.is_whitelisted(&ctx),
                    "quotas": evaluator.applicable_quotas(&ctx),
                })
            );
        }
        Command::Check {
            request,
            count,
            quantity,
            interval_ms,
            endpoint_quota,
            disabled,
        } => {
            let endpoint = match (disabled, endpoint_quota) {
                (true, _) => EndpointThrottle::Disabled,
                (false, Some(quota)) => EndpointThrottle::Quota(quota),
                (false, None) => EndpointThrottle::Inherit,
            };

            let cluster = if options.use_distributed {
                let config = options.mesh.to_cluster_config();
                Some(Arc::new(Cluster::start(config).await?))
            } else {
                None
            };

            let store: Arc<dyn RateLimitStore> = match &cluster {
                Some(cluster) => Arc::new(MeshStore::new(cluster.clone())),
                None => Arc::new(MemoryStore::new()),
            };

            let guard = ThrottleGuard::with_service(
                options.enable_global_filter,
                Arc::new(evaluator),
                RateLimiter::new(store),
            );

            let ctx = request.to_context();
            info!(client = %ctx.client_address, count, "Running admission checks");

            for seq in 1..=count {
                let admission = guard.check_quantity(&ctx, endpoint, quantity).await?;
                println!("{}", admission_json(seq, &admission));

                if interval_ms > 0 && seq < count {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }

            drop(guard);
            if let Some(cluster) = cluster {
                match Arc::try_unwrap(cluster) {
                    Ok(cluster) => cluster.shutdown().await?,
                    Err(_) => warn!("Cluster still referenced, skipping shutdown"),
                }
            }
        }
    }

    Ok(())
}
