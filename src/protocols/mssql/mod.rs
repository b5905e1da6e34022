//! MSSQL handshake probe (default port 1433)
//!
//! The scan sends a PRELOGIN message, reads the server's PRELOGIN response
//! and, when both sides allow encryption, runs a TLS handshake tunneled
//! inside TDS packets. It reports the server version, the instance name,
//! the negotiated encryption mode and the TLS log.
//!
//! Only `ENCRYPT_NOT_SUP` skips TLS on the client side: even `ENCRYPT_OFF`
//! encrypts the login step, so the handshake still runs.

pub mod connection;
pub mod prelogin;
pub mod scanner;
pub mod tds;
pub mod tunnel;

pub use connection::TdsConnection;
pub use prelogin::{EncryptMode, PreloginOptions, ServerVersion};
pub use scanner::{MssqlResults, MssqlScanner};
pub use tds::{TdsHeader, TdsPacketType};
pub use tunnel::TdsTlsAdapter;
