pub mod codec;
pub mod errors;
pub mod forward_request;
pub mod frame;

pub use codec::*;
pub use errors::*;
pub use forward_request::*;
pub use frame::*;
