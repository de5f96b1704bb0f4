//! Service layer

mod manager;

pub use manager::{AddressReport, IpamService, IpamStats};
