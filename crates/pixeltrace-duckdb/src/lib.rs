pub mod backend;
pub mod etl;
pub mod geo;
pub mod identity;
pub mod reputation;
pub mod schema;
pub mod scoring;
mod watermark;

pub use backend::StoreBackend;
pub use etl::EtlOutcome;
pub use geo::GeoStore;
pub use identity::IdentityOutcome;
pub use scoring::ScoringOutcome;
