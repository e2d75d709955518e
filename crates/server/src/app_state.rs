use std::sync::Arc;

use server_api::ApiContext;

use crate::ws::ConnectionTable;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) connections: Arc<ConnectionTable>,
    pub(crate) auth_secret: String,
}
