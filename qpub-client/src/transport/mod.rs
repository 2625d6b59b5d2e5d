//! Transport adapters: the streaming socket backend and the HTTP requester.

pub(crate) mod http;
pub(crate) mod ws;

pub use self::http::{HttpRequester, RestError};
