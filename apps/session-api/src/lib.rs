pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod membership;
pub mod models;
pub mod routes;
pub mod store;
pub mod tasks;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use gateway::fanout::GatewayBroadcast;
use gateway::notifier::GatewayNotifier;
use gateway::presence::PresenceDirectory;
use membership::MembershipEngine;
use store::SessionStore;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub config: Arc<Config>,
    pub engine: Arc<MembershipEngine>,
    pub broadcast: GatewayBroadcast,
    pub presence: Arc<PresenceDirectory>,
}

impl AppState {
    /// Wire the engine to the gateway over the given backends.
    pub fn new(config: Config, store: Arc<dyn SessionStore>, kv: Arc<dyn KeyValueStore>) -> Self {
        let broadcast = GatewayBroadcast::new();
        let presence = Arc::new(PresenceDirectory::new());
        let notifier = Arc::new(GatewayNotifier::new(broadcast.clone(), presence.clone()));
        let engine = Arc::new(MembershipEngine::new(store.clone(), notifier, config.policy()));

        Self {
            store,
            kv,
            config: Arc::new(config),
            engine,
            broadcast,
            presence,
        }
    }
}
