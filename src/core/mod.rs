// Module declarations
pub mod config;
pub mod error;
pub mod logging;
pub mod privilege;
pub mod server_instance;
pub mod timeout;
pub mod user;
pub mod value;

// Re-exports for convenience
pub use config::{
    LimitsSection, LoggingSection, NetworkSection, ReadOnlySection, ServerConfig, ServerSection,
};
pub use error::{ER_DB_READ_ONLY, ER_QUERY_THROTTLED, ErrorClass, ServerError, ThrottleKind};
pub use logging::init_logging;
pub use privilege::{PrivilegeScope, Privileges};
pub use server_instance::{DbReadOnly, ServerInstance};
pub use timeout::Timeout;
pub use user::{User, UserStore, scramble_password};
pub use value::Value;
