//! ViralGen HTTP 服务
//!
//! 启动: cargo run --bin viralgen-server
//! 监听地址来自 [app] bind_addr（默认 0.0.0.0:8000），可用 VIRALGEN__APP__BIND_ADDR 覆盖。

use std::sync::Arc;

use anyhow::Context;
use viralgen::api::{create_router, AppState};
use viralgen::core::create_automation_builder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    viralgen::observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let builder = create_automation_builder(config_path);
    let addr = builder.config().app.bind_addr.clone();
    let proxies = builder.shared_proxies().len();

    let app = create_router(Arc::new(AppState::new(builder)));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, proxies, "ViralGen API listening");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
