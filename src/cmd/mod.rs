//! CLI command implementations.
//!
//! | Module     | Commands handled                 |
//! |------------|----------------------------------|
//! | `connect`  | `Connect`, `Repair`, `Resume`    |
//! | `accounts` | `Accounts`                       |
//! | `config`   | `Config`                         |

pub mod accounts;
pub mod config;
pub mod connect;

pub use accounts::cmd_accounts;
pub use config::cmd_config;
pub use connect::{cmd_connect, cmd_repair, cmd_resume};
