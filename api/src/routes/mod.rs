pub mod attempts;
pub mod health;
pub mod progress;
pub mod reports;
