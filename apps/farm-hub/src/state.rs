use std::sync::Arc;
use std::time::Duration;

use farm_store::DeviceStore;

use crate::auth::AuthKeys;
use crate::config::GridSettings;
use crate::registry::Registry;
use crate::selection::Window;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn DeviceStore>,
    pub http: reqwest::Client,
    pub grid: GridSettings,
    pub auth: Option<Arc<AuthKeys>>,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn DeviceStore>,
        grid: GridSettings,
        auth: Option<Arc<AuthKeys>>,
    ) -> Self {
        Self {
            registry,
            store,
            http: build_http_client(),
            grid,
            auth,
        }
    }

    pub fn window(&self) -> Window {
        Window {
            now_ms: farm_proto::now_millis(),
            freshness_ms: self.grid.freshness_ms,
        }
    }
}

/// Upstream client. Session creation can take minutes (app installs), so only
/// the connect phase is bounded.
fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
