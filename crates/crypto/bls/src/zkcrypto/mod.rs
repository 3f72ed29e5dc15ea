pub mod aggregate_pubkey;
pub mod private_key;
pub mod pubkey;
pub mod signature;
