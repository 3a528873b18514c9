//! Core contracts for Cellar: durable storage backends, platform key vaults,
//! and the cipher suite vocabulary shared between them.

pub mod cipher;
pub mod storage;
pub mod vault;
