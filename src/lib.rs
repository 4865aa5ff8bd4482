pub mod agent;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod humanize;
pub mod locks;
pub mod model;
pub mod observability;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod supervisor;
pub mod tasks;
