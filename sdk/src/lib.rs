//! # HousePortal SDK
//!
//! The client side of a house-portal deployment, for use inside backend
//! application processes:
//!
//! - **Registrar**: declare the URL paths an application serves, and keep
//!   renewing the declaration so the portal's 180 s horizon never passes.
//! - **Discovery**: walk every known portal and maintain an index of
//!   `(service, url)` pairs offered anywhere on the fleet.
//!
//! ## Declaring paths
//!
//! ```no_run
//! use house_portal_sdk::register::{Registrar, RegistrarOptions};
//!
//! # async fn example() -> Result<(), house_portal_sdk::Error> {
//! let registrar = Registrar::new(RegistrarOptions::default()).await?;
//!
//! // The relay controller serves two paths on port 8081; both belong to
//! // the "control" service.
//! registrar.declare(
//!     8081,
//!     vec![
//!         "control:/houserelays".to_string(),
//!         "/houserelays/raw".to_string(),
//!     ],
//! );
//!
//! // Send now and every 30 seconds from here on.
//! registrar.spawn();
//! # Ok(())
//! # }
//! ```
//!
//! ## Discovering services
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use house_portal_sdk::discovery::Discovery;
//!
//! # async fn example() {
//! let discovery = Arc::new(Discovery::new("127.0.0.1:80"));
//! discovery.spawn();
//!
//! // Later, from anywhere in the application:
//! for (service, url) in discovery.services() {
//!     println!("{} offered at {}", service, url);
//! }
//! # }
//! ```

pub mod discovery;
pub mod register;

pub use codec::crypto::Key;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Codec(#[from] codec::Error),

    #[error("request timed out")]
    Timeout,
}
