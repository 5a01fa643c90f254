use std::sync::Arc;
use std::time::Duration;

use agent_sentinel::config::{load_env_file, ProxyConfig};
use agent_sentinel::providers::{AnthropicProvider, GeminiProvider, OpenAiProvider, Provider};
use agent_sentinel::proxy::{router, ProxyState};
use agent_sentinel::runner::BoundedRunner;
use agent_sentinel::spend::{RedisSpendStore, SpendAccountant};
#[cfg(unix)]
use agent_sentinel::UdsLoopClient;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = load_env_file(".env");
    let config = ProxyConfig::from_env();

    let _otel_guard = match config.otel_endpoint.as_deref() {
        Some(endpoint) => Some(agent_sentinel::otel::init_tracing(
            "agent-sentinel",
            Some(endpoint),
            true,
        )?),
        None => {
            agent_sentinel::otel::init_logging(true)?;
            None
        }
    };

    let provider = provider_from_env()?;
    let runner = BoundedRunner::new(config.async_op_limit);
    let mut state = ProxyState::new(provider.clone(), runner.clone())?
        .with_tenant_header(&config.tenant_header)?
        .with_intervention_hint(config.intervention_hint.clone());

    match config.redis_url.as_deref() {
        Some(redis_url) => {
            let store = RedisSpendStore::new(redis_url, config.default_spend_limit)?;
            if let Err(err) = store.ping().await {
                tracing::warn!(
                    error = %err,
                    "redis unreachable at startup, spend checks will fail open"
                );
            }
            let accountant = SpendAccountant::new(Arc::new(store), config.default_spend_limit);
            state = state.with_accountant(Arc::new(accountant));
        }
        None => {
            tracing::info!("REDIS_URL not set, spend governance disabled");
        }
    }

    #[cfg(unix)]
    if let Some(socket) = config.sidecar_socket.as_ref() {
        state = state.with_detector(Arc::new(UdsLoopClient::new(
            socket.clone(),
            config.sidecar_timeout,
        )));
        tracing::info!(socket = %socket.display(), "loop detection sidecar configured");
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(
        addr = %config.listen_addr,
        provider = provider.name(),
        upstream = %provider.base_url(),
        "agent sentinel listening"
    );

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    let grace = async {
        shutdown_signal().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    };
    tokio::select! {
        result = async { server.await } => result?,
        _ = grace => {
            tracing::warn!("in-flight grace period elapsed, closing remaining connections");
        }
    }

    let pending = runner.drain(SHUTDOWN_GRACE).await;
    if pending > 0 {
        tracing::warn!(pending, "drain deadline reached with settlement tasks unfinished");
    }
    Ok(())
}

fn provider_from_env() -> Result<Arc<dyn Provider>, Box<dyn std::error::Error>> {
    let target = std::env::var("TARGET_API").unwrap_or_default();
    let gemini_key = std::env::var("GEMINI_API_KEY").unwrap_or_default();
    let openai_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    let anthropic_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();

    let provider: Arc<dyn Provider> = match target.as_str() {
        "openai" => Arc::new(OpenAiProvider::new(require(openai_key, "OPENAI_API_KEY")?)?),
        "gemini" => Arc::new(GeminiProvider::new(require(gemini_key, "GEMINI_API_KEY")?)?),
        "anthropic" => Arc::new(AnthropicProvider::new(require(
            anthropic_key,
            "ANTHROPIC_API_KEY",
        )?)?),
        "" => {
            if !gemini_key.is_empty() {
                Arc::new(GeminiProvider::new(gemini_key)?)
            } else if !openai_key.is_empty() {
                Arc::new(OpenAiProvider::new(openai_key)?)
            } else if !anthropic_key.is_empty() {
                Arc::new(AnthropicProvider::new(anthropic_key)?)
            } else {
                return Err(
                    "no provider API key set (GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY)"
                        .into(),
                );
            }
        }
        other => return Err(format!("unsupported TARGET_API: {other}").into()),
    };
    Ok(provider)
}

fn require(value: String, name: &str) -> Result<String, Box<dyn std::error::Error>> {
    if value.is_empty() {
        return Err(format!("{name} environment variable is not set").into());
    }
    Ok(value)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
