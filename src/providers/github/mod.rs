mod client;
mod core;

pub use self::client::GitHubClient;
pub use self::core::GitHubActions;
