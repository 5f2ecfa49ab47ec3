//! Serve an in-memory registry with one image already pushed
//!
//! Run with: cargo run -p registry --example basic_server
//! Then try: curl http://127.0.0.1:5000/v2/demo/app/manifests/latest

use camino::Utf8Path;
use registry::{Digest, EventPump, RegistryBuilder, RegistryConfig};
use storage::{IndexConfig, MemoryStorage, Storage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let storage: Storage = MemoryStorage::with_buckets(&["registry"]).into();
    let events = storage.subscribe().ok_or("memory storage has no notifications")?;

    let config = RegistryConfig::default();
    let index = IndexConfig::Memory.build(&config.tables.specs()).await?;
    let registry = RegistryBuilder::new(storage.clone(), index)
        .config(config)
        .build();

    tokio::spawn(EventPump::new(registry.handler().clone()).run(events));

    let bucket = storage.bucket("registry");
    let layer = b"hello from the demo layer";
    let layer_digest = Digest::sha256(layer);
    bucket
        .upload(Utf8Path::new(&format!("blobs/{layer_digest}")), &mut &layer[..])
        .await?;

    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {"digest": layer_digest, "size": layer.len()},
        "layers": [{"digest": layer_digest, "size": layer.len()}],
    }))?;
    bucket
        .upload(Utf8Path::new("manifests/demo/app:latest"), &mut &manifest[..])
        .await?;

    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("registry listening on http://{addr}");

    axum::serve(listener, registry.router()).await?;
    Ok(())
}
