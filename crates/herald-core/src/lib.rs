pub mod clock;
pub mod errors;
pub mod events;
pub mod ids;
pub mod instance;
pub mod message;
pub mod rate_limit;
pub mod transport;
