//! Result Listener Service - Entry Point
//!
//! Consumes image processing results from the Redis result stream.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    result_listener::run().await
}
