pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod framing;
pub mod protocol;
pub mod search;
pub mod session;
pub mod tls;
pub mod transport;

pub use config::{ConnectionSettings, TlsSettings};
pub use connection::{LdapConnection, SaslBindOutcome};
pub use error::{LdapError, Result};
pub use filter::Filter;
pub use framing::SecurityContext;
pub use protocol::{Control, PartialAttribute, ResultCode};
pub use search::{SearchEntry, SearchPaginator, SearchStream};
pub use session::{ConnectionState, SearchOptions};
