mod cookies;
mod dispatcher;
mod endpoints;
mod request;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use cookies::SessionCookies;
pub use dispatcher::Dispatcher;
pub use endpoints::Endpoints;
pub use request::{ApiRequest, ApiResponse, Attempt, Outcome};
pub use transport::{ReqwestTransport, Transport};
