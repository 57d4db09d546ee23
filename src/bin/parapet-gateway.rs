#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let settings = match parapet::Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let state = match parapet::GatewayHttpState::from_settings(&settings) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "failed to build outbound client");
            std::process::exit(1);
        }
    };
    let app = parapet::router(state);

    let listener = match tokio::net::TcpListener::bind(settings.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(addr = %settings.listen_addr, error = %err, "bind failed");
            std::process::exit(2);
        }
    };

    tracing::info!(addr = %settings.listen_addr, "parapet-gateway listening");
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    });

    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server error");
        std::process::exit(2);
    }
}
