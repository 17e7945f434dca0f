use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::publisher::{PrintPublisher, PubSocket, Publisher};
use crate::router;

async fn create_publisher(config: &Config) -> anyhow::Result<Arc<dyn Publisher + Send + Sync>> {
    if config.print_publisher {
        tracing::warn!("printing uploads instead of publishing them");
        return Ok(Arc::new(PrintPublisher {}));
    }

    let socket = PubSocket::bind(
        &config.bindings(),
        config.publish_buffer_frames,
        config.max_frame_bytes,
    )
    .await?;
    Ok(Arc::new(socket))
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let publisher = create_publisher(&config)
        .await
        .expect("failed to bind publisher");

    serve_with_publisher(config, listener, publisher, shutdown).await
}

/// Serves uploads into an already set up publisher, closing it once the HTTP side has
/// drained.
pub async fn serve_with_publisher<F>(
    config: Config,
    listener: TcpListener,
    publisher: Arc<dyn Publisher + Send + Sync>,
    shutdown: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router::router(
        publisher.clone(),
        config.salt(),
        config.publish_concurrency_limit,
        config.max_payload_bytes,
        config.export_prometheus,
    );

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("could not read listener address: {}", e),
    }

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        tracing::error!("server stopped with error: {}", e);
    }

    publisher.close().await;
    tracing::info!("gateway shutdown completed");
}
