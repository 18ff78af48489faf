//! Minimal upstream for trying the router locally.
//!
//! `GET /` answers with a greeting naming this instance, `GET /healthz`
//! answers the health prober.

use std::net::SocketAddr;

use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "demo-backend")]
#[command(about = "Demo upstream server for upstream-router", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:9001")]
    bind: SocketAddr,

    /// Instance name reported in responses (defaults to $HOSTNAME)
    #[arg(short, long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let host = cli
        .name
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| cli.bind.to_string());

    let app = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(host.clone());

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    println!("demo-backend {host} listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root(State(host): State<String>) -> Json<Value> {
    Json(json!({ "message": "Hello from behind upstream-router!", "host": host }))
}

async fn healthz(State(host): State<String>) -> Json<Value> {
    Json(json!({ "ok": true, "host": host }))
}
