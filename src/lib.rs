pub mod assembler;
pub mod builder;
pub mod config;
pub mod context;
pub mod delete;
pub mod edit;
pub mod error;
pub mod logging;
pub mod network;
pub mod next_step;
pub mod onyx;
pub mod policy;
pub mod report;
pub mod report_action;
pub mod request;
pub mod service;
pub mod settlement;
pub mod split;
pub mod store;
pub mod transaction;
pub mod types;
pub mod utils;
pub mod violations;

pub use context::EngineContext;
pub use error::IouError;
pub use service::IouService;
