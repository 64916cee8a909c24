pub mod addr;
pub mod dialer;
pub mod error;
pub mod stream;
pub mod tls;

pub use addr::Address;
pub use dialer::{Dialer, DialerConfig};
pub use error::{CheckError, CheckErrorKind};
pub use stream::ProbeStream;
