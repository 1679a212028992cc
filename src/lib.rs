//! Platform connection orchestrator.
//!
//! Connects external messaging platforms (Facebook, Instagram, WhatsApp,
//! Telegram) to a tenant: runs the provider authorization flow, reconciles
//! its result from three delivery channels, lets the user pick a page or
//! channel, and provisions the webhook account plus routing mapping.
//!
//! | Module        | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | `coordinator` | Session state machine, the public entry point          |
//! | `session`     | Single in-flight session and its watch snapshot        |
//! | `multiplexer` | Poll / window message / fallback cache reconciliation  |
//! | `selector`    | Empty / single / multiple resource handling            |
//! | `finalizer`   | Account + mapping writes, repair mode                  |
//! | `detector`    | Reconnection scan and aggregated notice                |
//! | `accounts`    | Listing, flag toggles, removal                         |
//! | `backend`     | REST collaborator trait and implementations            |
//! | `channel`     | Authorization window trait and loopback implementation |
//! | `fallback`    | Persistent write-once result cache                     |
//! | `events`      | UI notifications                                       |
//! | `config`      | `connect.toml` and environment layering                |
//! | `telemetry`   | Tracing subscriber setup                               |

pub mod accounts;
pub mod backend;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod errors;
pub mod events;
pub mod fallback;
pub mod finalizer;
pub mod models;
pub mod multiplexer;
pub mod selector;
pub mod session;
pub mod telemetry;

pub use coordinator::Coordinator;
pub use errors::{BackendError, ChannelError, ConnectError};
