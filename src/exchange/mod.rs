pub mod client;
pub mod instruments;
pub mod private_ws;
pub mod retry;
pub mod ws;

pub use client::{format_number, ws_auth_signature, BybitRestClient};
pub use instruments::{InstrumentRegistry, InstrumentRule};
pub use private_ws::{run_private_stream, PrivateEvent};
pub use retry::{backoff_delay, classify_ret_code, with_retry, RetryClass};
pub use ws::{parse_public_message, run_public_stream, PublicEvent};
