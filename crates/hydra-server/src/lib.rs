//! # hydra-server
//!
//! HTTP API for Open Hydra sandbox devices, built on axum.
//!
//! Every route lives under `/apis/{group}/v1` and, apart from discovery and
//! login, goes through the authentication middleware.
//!
//! ## API Endpoints
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/devices` | GET | Every user's device (privileged) |
//! | `/devices` | POST | Provision a device |
//! | `/devices/{username}` | GET | One device |
//! | `/devices/{username}` | PUT | Last composed view of a device |
//! | `/devices/{username}` | DELETE | Remove a device |
//! | `/sumups` | GET | GPU accounting |
//! | `/openhydrausers` | GET, POST | List or register users |
//! | `/openhydrausers/{name}` | GET, PUT, PATCH, DELETE | One user |
//! | `/openhydrausers/login/{name}` | POST | Check credentials |
//! | `/settings/{name}` | GET, PUT | Runtime settings |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use server::HydraServer;
pub use state::AppState;
