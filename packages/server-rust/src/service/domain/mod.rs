//! Domain services hosted by the broker.
//!
//! - [`users`]: accounts, login and token resolution
//! - [`products`]: static catalog

pub mod products;
pub mod users;

pub use products::ProductsService;
pub use users::UsersService;
