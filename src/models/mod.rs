pub mod driver;
pub mod offer;
pub mod ride;
