use movie_game_backend::{app, config::Config, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let state = AppState::from_config(&config).await;
    let app = app(state);

    tracing::info!(addr = %config.bind_addr, "starting server");
    axum::serve(
        tokio::net::TcpListener::bind(&config.bind_addr)
            .await
            .expect("bind"),
        app,
    )
    .await
    .expect("server error");
}
