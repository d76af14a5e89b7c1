pub mod conversions;
pub mod health;
pub mod ws;
