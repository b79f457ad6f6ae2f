pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod hub;
pub mod registry;
pub mod service;
pub mod session;
pub mod store;

pub use delivery::Delivery;
pub use error::ChatError;
pub use service::ChatService;
