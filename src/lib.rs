pub mod application;
pub mod config;
pub mod server;
pub mod session;

pub use application::{AjpRequest, AjpResponse, Application, PingApplication};
pub use config::Config;
pub use server::connector::Connector;
pub use session::{AffinityToken, InMemorySessionStore, SessionStore, AFFINITY_COOKIE_NAME};
