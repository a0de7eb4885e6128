use postline_infra::config::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    postline_observability::init("postline-scheduler");

    let config = PipelineConfig::from_env()?;
    let store = postline_api::services::connect_store(config.require_database_url()?).await?;
    postline_api::services::run_scheduler(store, &config).await
}
