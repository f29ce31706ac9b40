// Walks through startup step by step to find where the server hangs or fails
// Run this with: cargo run --bin debug_startup

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use admission_control::{
    cache::build_store,
    config::Settings,
    token::{Role, TokenVerifier},
    utils::TimeSource,
    Tier,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with more verbose output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting debug startup test...");

    let start_time = Instant::now();

    let settings = load_settings()?;
    test_token_round_trip(&settings)?;
    test_counter_store(&settings).await?;

    info!("✅ All checks completed successfully in {:?}", start_time.elapsed());
    Ok(())
}

fn load_settings() -> Result<Settings> {
    let config_path = std::env::var("CONFIG_PATH").ok();
    info!("🔍 Loading settings from {:?}...", config_path);

    match Settings::load(config_path.as_deref()) {
        Ok(settings) => {
            for tier in Tier::ALL {
                let quota = settings.tier_quota(tier);
                info!("Tier {}: {} requests / {}ms", tier, quota.limit, quota.window_ms);
            }
            info!("✅ Settings valid");
            Ok(settings)
        }
        Err(e) => {
            error!("❌ Settings rejected: {}", e);
            Err(e.into())
        }
    }
}

fn test_token_round_trip(settings: &Settings) -> Result<()> {
    info!("🔍 Testing token issue/verify with {:?}...", settings.token.algorithm);

    let verifier = TokenVerifier::new(&settings.token);
    let token = verifier.issue("debug-startup", Role::Standard)?;
    match verifier.verify(Some(&format!("Bearer {}", token))) {
        Ok(claim) => {
            info!("✅ Token verified for subject {}", claim.sub);
            Ok(())
        }
        Err(failure) => {
            error!("❌ Freshly issued token failed verification: {}", failure);
            Err(anyhow::anyhow!("token round trip failed: {}", failure))
        }
    }
}

async fn test_counter_store(settings: &Settings) -> Result<()> {
    info!("🔍 Building {:?} counter store...", settings.store.backend);

    let store_start = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        build_store(&settings.store, TimeSource::new()),
    )
    .await;

    let store = match result {
        Ok(Ok(store)) => {
            info!("✅ {} store ready in {:?}", store.name(), store_start.elapsed());
            store
        }
        Ok(Err(e)) => {
            error!("❌ Counter store creation failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("❌ Counter store creation timed out after 10 seconds");
            error!("This suggests a network connectivity issue or Redis server is not responding");
            return Err(anyhow::anyhow!("Counter store connection timeout"));
        }
    };

    let health_start = Instant::now();
    match store.health_check().await {
        Ok(()) => {
            info!("✅ Health check passed in {:?}", health_start.elapsed());
            Ok(())
        }
        Err(e) => {
            error!("❌ Health check failed: {}", e);
            Err(e.into())
        }
    }
}
