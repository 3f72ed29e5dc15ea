//! The beacon chain state-transition function: per-slot and per-block processing, the epoch
//! transition, and the caches that keep both O(validators)-free on the hot path.

pub mod attestation;
pub mod attestation_data;
pub mod attester_slashing;
pub mod attester_status;
pub mod beacon_block;
pub mod beacon_block_body;
pub mod beacon_block_header;
pub mod beacon_state;
pub mod cached_state;
pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod deposit;
pub mod deposit_data;
pub mod deposit_message;
pub mod epoch_cache;
pub mod epoch_process;
pub mod eth_1_data;
pub mod execution_engine;
pub mod execution_payload;
pub mod execution_payload_header;
pub mod fork;
pub mod fork_data;
pub mod fork_schedule;
pub mod genesis;
pub mod historical_batch;
pub mod indexed_attestation;
pub mod misc;
pub mod proposer_slashing;
pub mod pubkey_cache;
pub mod shuffling;
pub mod signing_data;
pub mod state_transition;
pub mod sync_aggregate;
pub mod sync_committee;
pub mod validator;
pub mod voluntary_exit;

pub use beacon_state::BeaconState;
pub use cached_state::CachedBeaconState;
pub use config::ChainConfig;
pub use epoch_cache::EpochContext;
pub use fork_schedule::ForkName;
