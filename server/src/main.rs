use std::path::PathBuf;
use std::sync::Arc;

use air_core::api::v1::{self, ApiState};
use air_core::db::init_db;
use air_core::dispatcher::Dispatcher;
use air_core::providers::ProviderGateway;
use air_core::store::ConversationStore;
use air_core::stream::StreamEmitter;
use directories::ProjectDirs;

fn data_dir() -> PathBuf {
    if let Some(proj) = ProjectDirs::from("dev", "AIR", "air") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("air")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let db = init_db(data_dir())?;
    let gateway = ProviderGateway::new()?;
    let store = ConversationStore::new(db.clone());
    let dispatcher = Dispatcher::new(db.clone(), store.clone(), Arc::new(gateway));
    let state = ApiState {
        db,
        store,
        dispatcher,
        emitter: StreamEmitter::default(),
    };

    let addr = std::env::var("AIR_ADDR").unwrap_or_else(|_| "127.0.0.1:5000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("air server listening on {addr}");
    axum::serve(listener, v1::router(state)).await?;
    Ok(())
}
