//! Reference tier providers. Real provider clients live in the integrating
//! application; these cover generic HTTP JSON lookups, lightweight scraping,
//! and deterministic fakes for tests and demos.

pub mod fixed;
pub mod http;
pub mod scrape;
