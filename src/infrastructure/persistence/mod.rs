//! SQLite persistence: connection pool, migrations and repositories

pub mod cdr_repository;
pub mod database;
pub mod dialplan_repository;
pub mod extension_repository;
pub mod flow_repository;
pub mod registration_repository;
pub mod resolver;
pub mod trunk_repository;
pub mod voicemail_repository;

pub use database::{connect, run_migrations};
pub use cdr_repository::SqliteCdrRepository;
pub use dialplan_repository::{
    SqliteConferenceBridgeRepository, SqliteInboundNumberRepository, SqliteIvrMenuRepository,
    SqlitePromptRepository, SqliteRingGroupRepository, SqliteTimeSwitchRepository,
};
pub use extension_repository::SqliteExtensionRepository;
pub use flow_repository::SqliteFlowRepository;
pub use registration_repository::SqliteRegistrationRepository;
pub use resolver::SqliteEntityResolver;
pub use trunk_repository::SqliteTrunkRepository;
pub use voicemail_repository::SqliteVoicemailRepository;
