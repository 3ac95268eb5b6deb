pub mod janitor;
pub mod manager;
pub mod meta;
pub mod webhooks;
pub mod worker;
