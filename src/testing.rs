//! HTTP stand-ins for buffer, database and compute servers in unit tests

use axum::Router;

/// Serve a router on an ephemeral local port; returns its base URL
pub(crate) async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
