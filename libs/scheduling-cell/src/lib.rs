pub mod events;
pub mod models;
pub mod services;
pub mod store;

pub use events::*;
pub use models::*;
pub use services::*;
pub use store::*;
