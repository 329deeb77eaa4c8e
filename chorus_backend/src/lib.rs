pub mod chat;
pub mod config;
pub mod database;
pub mod directory;
pub mod http_client;
pub mod llm_client;
pub mod pacing;
pub mod persona;
pub mod runtime;
pub mod scope_lock;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
