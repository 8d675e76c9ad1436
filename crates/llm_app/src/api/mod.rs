mod error;
mod handler;
mod request;
mod response;
mod routes;
mod state;
mod wrapper;

pub use routes::http_server;
pub use state::AppState;
