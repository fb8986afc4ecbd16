use std::sync::Arc;
use std::time::Duration;

use facet::Facet;
use reflecta_core::context::RequestContext;
use reflecta_core::metadata::Metadata;
use reflecta_core::pipeline::Pipeline;
use reflecta_core::registry::TypeConfig;
use reflecta_core::Record;
use reflecta_store::{MemoryStore, RecordStore};
use reflecta_web::AppBuilder;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Facet, Clone, Debug)]
struct Widget {
    id: String,
    generation: u64,
    etag: String,
    text: String,
}

impl Record for Widget {
    fn metadata(&self) -> Metadata {
        Metadata {
            id: self.id.clone(),
            generation: self.generation,
            etag: self.etag.clone(),
        }
    }
    fn set_metadata(&mut self, m: Metadata) {
        self.id = m.id;
        self.generation = m.generation;
        self.etag = m.etag;
    }
}

/// Backs `Authorization: Basic` lookups: any mounted type can opt a field pair
/// into that role via `TypeConfig::auth_basic`, this is just the one the demo
/// wires up.
#[derive(Facet, Clone, Debug)]
struct User {
    id: String,
    generation: u64,
    etag: String,
    username: String,
    password_hash: String,
}

impl Record for User {
    fn metadata(&self) -> Metadata {
        Metadata {
            id: self.id.clone(),
            generation: self.generation,
            etag: self.etag.clone(),
        }
    }
    fn set_metadata(&mut self, m: Metadata) {
        self.id = m.id;
        self.generation = m.generation;
        self.etag = m.etag;
    }
}

fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}

#[tokio::main]
async fn main() {
    let log_filter = std::env::var("REFLECTA_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let listen_addr = std::env::var("REFLECTA_LISTEN").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let idempotency_ttl = env_duration_secs("REFLECTA_IDEMPOTENCY_TTL_SECS", 300);
    let heartbeat = env_duration_secs("REFLECTA_SSE_HEARTBEAT_SECS", 5);

    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

    let widget_config = Arc::new(
        TypeConfig::<Widget>::new("widget")
            .may_read(|_widget, _ctx| Ok(()))
            .may_write(|_ctx, _candidate, _prev| Ok(())),
    );
    widget_config.check_safe();

    let user_config = Arc::new(
        TypeConfig::<User>::new("users")
            .may_read(|_user, ctx| {
                if ctx.principal().is_some() || ctx.is_internal_replication() {
                    Ok(())
                } else {
                    Err(reflecta_core::Error::forbidden("anonymous callers may not read users"))
                }
            })
            .may_write(|_ctx, _candidate, _prev| Ok(()))
            .auth_basic("username", "password_hash"),
    );
    user_config.check_safe();

    seed_admin_user(store.clone(), user_config.clone()).await;

    let app = AppBuilder::new(store, idempotency_ttl)
        .heartbeat(heartbeat)
        .mount(widget_config)
        .mount(user_config)
        .build();

    let listener = TcpListener::bind(&listen_addr)
        .await
        .unwrap_or_else(|e| panic!("[reflecta-demo] failed to bind {listen_addr}: {e}"));
    info!(%listen_addr, "reflecta-demo listening");

    axum::serve(listener, app)
        .await
        .unwrap_or_else(|e| panic!("[reflecta-demo] server exited: {e}"));
}

/// Seeds one admin user so `Authorization: Basic` has something to
/// authenticate against on a fresh process; password is `admin` for demo
/// purposes only.
async fn seed_admin_user(store: Arc<dyn RecordStore>, config: Arc<TypeConfig<User>>) {
    let pipeline = Pipeline::new(store, config);
    let password_hash = bcrypt::hash("admin", bcrypt::DEFAULT_COST).expect("hash seed password");
    let admin = User {
        id: String::new(),
        generation: 0,
        etag: String::new(),
        username: "admin".into(),
        password_hash,
    };
    match pipeline.create(&RequestContext::internal_replication(), admin).await {
        Ok(created) => info!(id = %created.id, "seeded admin user"),
        Err(e) => tracing::error!(error = %e, "failed to seed admin user"),
    }
}
