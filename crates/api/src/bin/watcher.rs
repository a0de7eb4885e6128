use postline_infra::config::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    postline_observability::init("postline-watcher");

    let config = PipelineConfig::from_env()?;
    let store = postline_api::services::connect_store(config.require_database_url()?).await?;
    postline_api::services::serve_watcher(store, &config.watcher_bind).await
}
