use std::sync::Arc;

use crate::config::Config;
use crate::session::manager::Manager;

pub mod offer;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<Manager>,
}
