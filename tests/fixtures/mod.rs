//! Test fixtures

mod server_client;

pub use server_client::ServerFixture;
