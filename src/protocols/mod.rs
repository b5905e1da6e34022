//! Protocol handshakes: MSSQL PRELOGIN/TDS, SMB negotiate and Telnet banner grab

pub mod mssql;
pub mod smb;
pub mod telnet;

pub use mssql::{MssqlResults, MssqlScanner};
pub use smb::{SmbLog, SmbScanner};
pub use telnet::{TelnetLog, TelnetScanner};
