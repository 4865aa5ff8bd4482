mod auth;
pub mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;
pub(crate) mod utils;
mod validation;

pub use auth::API_KEY_HEADER;
pub use server::{router, run};
