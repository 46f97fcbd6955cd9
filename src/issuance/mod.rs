pub mod certificate;
pub mod client;
pub mod csr;
pub mod issuer;
