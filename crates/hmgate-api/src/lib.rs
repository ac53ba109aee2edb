// hmgate-api: Async RPC clients and callback listener for HomeMatic-style backends (primary + legacy)

pub mod auth;
pub mod callback;
pub mod error;
pub mod legacy;
pub mod primary;
pub mod request;
pub mod transport;
pub mod types;

pub use auth::{Credentials, Protocol};
pub use callback::{CallbackEvent, CallbackReceiver, CallbackServer};
pub use error::Error;
pub use legacy::LegacyClient;
pub use primary::PrimaryClient;
pub use request::{RequestClient, RequestPolicy};
pub use transport::{TlsMode, TransportConfig};
pub use types::{
    DeviceDescription, DeviceSummary, Flags, Operations, ParameterDescription, ParameterType,
    Paramset, ParamsetDescription, ParamsetKind, SpecialValue, Value,
};
