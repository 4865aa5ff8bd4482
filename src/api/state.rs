use std::sync::Arc;

use crate::config::Config;
use crate::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(config: Arc<Config>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { config, dispatcher }
    }
}
