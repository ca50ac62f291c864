pub mod health;
pub mod watchers;
