use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};

use collab_server::config::ServerConfig;
use collab_server::connection::ws_index;
use collab_server::server::spawn_server;
use collab_system::{
    Identity, IdentityResolver, LoggingSink, PermissionTable, Role, SpaceType, StaticResolver,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = ServerConfig::from_env();
    let resolver = load_resolver()?;
    let srv_tx = spawn_server(
        config.clone(),
        resolver,
        Arc::new(LoggingSink),
        Arc::new(PermissionTable::default()),
    );

    let bind = config.bind.clone();
    log::info!("listening on {}", bind);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(srv_tx.clone()))
            .app_data(web::Data::new(config.clone()))
            .route("/ws/", web::get().to(ws_index))
    })
    .bind(bind.as_str())?
    .run()
    .await
}

/// `COLLAB_TOKENS` points at a JSON token map exported by the auth service;
/// without it, a fixed set of development identities is used.
fn load_resolver() -> std::io::Result<Arc<dyn IdentityResolver>> {
    if let Ok(path) = std::env::var("COLLAB_TOKENS") {
        let json = std::fs::read_to_string(&path)?;
        let resolver = StaticResolver::from_json(&json)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        log::info!("loaded token map from {}", path);
        Ok(Arc::new(resolver))
    } else {
        log::warn!("COLLAB_TOKENS not set, using development identities");
        Ok(Arc::new(StaticResolver::new(dev_identities())))
    }
}

fn dev_identities() -> HashMap<String, Identity> {
    let identity = |user_id, role| Identity {
        user_id,
        space_id: 1,
        role,
        space_type: SpaceType::Team,
    };
    HashMap::from([
        ("dev-admin".into(), identity(1, Role::Admin)),
        ("dev-editor".into(), identity(2, Role::Editor)),
        ("dev-viewer".into(), identity(3, Role::Viewer)),
    ])
}
